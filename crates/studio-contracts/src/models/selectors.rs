use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let fallback_reason = match requested {
            Some(name) => {
                if let Some(model) = self.registry.ensure(name, capability) {
                    return Ok(ModelSelection {
                        model,
                        requested: Some(name.to_string()),
                        fallback_reason: None,
                    });
                }
                format!("Requested model '{name}' unavailable for capability '{capability}'.")
            }
            None => "No model specified; using default.".to_string(),
        };

        let Some(model) = self.registry.by_capability(capability).into_iter().next() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::models::{DEFAULT_IMAGE_MODEL, DRYRUN_IMAGE_MODEL};

    #[test]
    fn explicit_model_is_kept() {
        let selection = ModelSelector::default()
            .select(Some(DRYRUN_IMAGE_MODEL), "image")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.provider, "dryrun");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn unknown_model_falls_back_with_reason() {
        let selection = ModelSelector::default()
            .select(Some("imagen-9"), "image")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, DEFAULT_IMAGE_MODEL);
        assert_eq!(selection.requested.as_deref(), Some("imagen-9"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'imagen-9' unavailable for capability 'image'.")
        );
    }

    #[test]
    fn blank_request_uses_default() {
        let selection = ModelSelector::default()
            .select(Some("  "), "image")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.requested, None);
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn empty_registry_errors() {
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(IndexMap::new()))));
        assert_eq!(
            selector.select(None, "image").err().unwrap_or_default(),
            "No models available for capability 'image'."
        );
    }
}
