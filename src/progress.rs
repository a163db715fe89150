use crate::models::PipelineResult;
use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle events streamed to the client while a batch runs. Tagged with
/// `type` (snake_case), payload keys camelCase; one event per SSE frame.
/// `Start` is always first and exactly one of `Complete`/`Error` is last.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start {
        message: String,
    },
    Analyzing {
        message: String,
    },
    Extracted {
        count: usize,
    },
    #[serde(rename_all = "camelCase")]
    SearchingImage {
        product_name: String,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    ImageFound {
        product_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ImageNotFound {
        product_name: String,
        source: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    GeneratingImage {
        product_name: String,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    ImageGenerated {
        product_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ProductSaved {
        product_name: String,
        current: usize,
        total: usize,
        save_type: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    VariantsCreated {
        product_name: String,
        variant_count: usize,
    },
    Complete {
        result: PipelineResult,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

/// Handle the orchestrator emits through. Detached for the sync and job
/// routes; attached to an mpsc channel the SSE handler drains. Emitting into
/// a closed channel is a no-op, and `is_closed` lets the orchestrator stop
/// work once the client has gone away.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(false)
    }

    /// Resolves once the receiving side has gone away. Pends forever for a
    /// detached sink, so select-ing on it only ever cancels streamed runs.
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

pub fn channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ProgressSink { tx: Some(tx) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_carry_snake_case_tags_and_camel_case_payloads() {
        let event = ProgressEvent::SearchingImage {
            product_name: "Ceviche".into(),
            current: 2,
            total: 5,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("json"),
            json!({"type": "searching_image", "productName": "Ceviche", "current": 2, "total": 5})
        );
    }

    #[test]
    fn saved_event_reports_disposition() {
        let event = ProgressEvent::ProductSaved {
            product_name: "Café Americano".into(),
            current: 1,
            total: 3,
            save_type: "updated",
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "product_saved");
        assert_eq!(value["saveType"], "updated");
    }

    #[test]
    fn complete_event_nests_the_result() {
        let event = ProgressEvent::Complete {
            result: PipelineResult {
                products_added: 2,
                products_updated: 1,
                total_extracted: 3,
                errors: vec!["Failed to create Pozole: HTTP 500".into()],
            },
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "complete");
        assert_eq!(value["result"]["productsAdded"], 2);
        assert_eq!(value["result"]["totalExtracted"], 3);
        assert_eq!(value["result"]["errors"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn error_event_omits_absent_details() {
        let event = ProgressEvent::Error {
            message: "no files uploaded".into(),
            details: None,
        };
        let value = serde_json::to_value(&event).expect("json");
        assert!(value.get("details").is_none());
    }

    #[tokio::test]
    async fn detached_sink_never_reports_closed() {
        let sink = ProgressSink::detached();
        assert!(!sink.is_closed());
        sink.emit(ProgressEvent::Extracted { count: 0 }).await;
    }

    #[tokio::test]
    async fn dropping_the_receiver_closes_the_sink() {
        let (sink, rx) = channel(4);
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
        // Emitting after close is a quiet no-op.
        sink.emit(ProgressEvent::Extracted { count: 1 }).await;
    }
}
