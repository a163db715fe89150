use crate::images::ImagePayload;
use crate::llm::LlmClient;
use tracing::warn;

/// The generation step of the chain. Only reached when web search produced
/// nothing (or was disabled). Returns a candidate or nothing; never an error.
pub async fn generate_image(
    llm: &LlmClient,
    name: &str,
    description: Option<&str>,
) -> Option<ImagePayload> {
    let prompt = generation_prompt(name, description);
    match llm.generate_image(&prompt).await {
        Ok(Some(image)) => Some(image.into()),
        Ok(None) => {
            warn!(target = "carta.images", product = name, "generation returned no image");
            None
        }
        Err(err) => {
            warn!(target = "carta.images", product = name, error = %err, "image generation failed");
            None
        }
    }
}

pub fn generation_prompt(name: &str, description: Option<&str>) -> String {
    let mut prompt = format!(
        "Professional food photography of {name}, plated and ready to serve, \
         natural lighting, shallow depth of field, appetizing, restaurant quality."
    );
    if let Some(detail) = description.map(str::trim).filter(|detail| !detail.is_empty()) {
        prompt.push_str(&format!(" The dish is: {detail}."));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_description_when_present() {
        let prompt = generation_prompt("Pad Thai", Some("rice noodles with shrimp"));
        assert!(prompt.contains("Pad Thai"));
        assert!(prompt.contains("rice noodles with shrimp"));
    }

    #[test]
    fn prompt_skips_blank_description() {
        let prompt = generation_prompt("Pad Thai", Some("   "));
        assert!(!prompt.contains("The dish is"));
    }
}
