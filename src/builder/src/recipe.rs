//! Recipe data model.
//!
//! Recipe parsing and substitution live outside the engine; the parser
//! hands over an ordered dependency list plus per-name layer records and
//! the engine only reads them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use strata_core::{Result, StrataError};

use crate::reference::tag_from_image_url;

/// Where a layer's base filesystem comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Another layer in the same recipe, referenced by `tag`.
    Built,
    /// A tarball, extracted into the fresh bundle.
    Tar,
    /// A local OCI layout, `url` = `<path>:<tag>`.
    Oci,
    /// A remote registry image, `url` = `docker://...`.
    Docker,
    /// An empty root filesystem.
    Scratch,
}

/// A layer's base image specifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub insecure: bool,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::scratch()
    }
}

impl ImageSource {
    pub fn scratch() -> Self {
        Self {
            source_type: SourceType::Scratch,
            url: String::new(),
            tag: String::new(),
            insecure: false,
        }
    }

    pub fn docker(url: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Docker,
            url: url.into(),
            tag: String::new(),
            insecure: false,
        }
    }

    pub fn oci(url: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Oci,
            url: url.into(),
            tag: String::new(),
            insecure: false,
        }
    }

    pub fn tar(url: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Tar,
            url: url.into(),
            tag: String::new(),
            insecure: false,
        }
    }

    pub fn built(tag: impl Into<String>) -> Self {
        Self {
            source_type: SourceType::Built,
            url: String::new(),
            tag: tag.into(),
            insecure: false,
        }
    }

    /// The tag under which this source's image is stored in the
    /// layer-base cache.
    pub fn parse_tag(&self) -> Result<String> {
        match self.source_type {
            SourceType::Docker => tag_from_image_url(&self.url),
            SourceType::Oci => tag_from_image_url(&format!("oci:{}", self.url)),
            _ => Err(StrataError::RecipeError(format!(
                "source type has no image tag: {:?}",
                self.source_type
            ))),
        }
    }
}

/// One layer record from the recipe.
///
/// The maps use ordered containers so that serializing a layer (for cache
/// fingerprinting) is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Layer {
    pub from: ImageSource,
    /// Preserve the filesystem as a snapshot for descendants but do not
    /// commit it to the output OCI.
    #[serde(default)]
    pub build_only: bool,
    /// Files and directories staged for the build rootfs.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Shell commands, concatenated into a single `-xe` script.
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    /// Sets the entrypoint and clears cmd.
    #[serde(default)]
    pub full_command: Option<Vec<String>>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// A parsed recipe: named layers in dependency order.
#[derive(Debug, Clone)]
pub struct Recipe {
    layers: HashMap<String, Layer>,
    build_order: Vec<String>,
    after_substitutions: String,
}

impl Recipe {
    /// Assemble a recipe from the parser's output. `ordered` is the
    /// dependency order (a topological sort the parser guarantees);
    /// `after_substitutions` is the full post-substitution recipe text.
    pub fn new(ordered: Vec<(String, Layer)>, after_substitutions: impl Into<String>) -> Self {
        let build_order = ordered.iter().map(|(name, _)| name.clone()).collect();
        let layers = ordered.into_iter().collect();
        Self {
            layers,
            build_order,
            after_substitutions: after_substitutions.into(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn build_order(&self) -> &[String] {
        &self.build_order
    }

    pub fn after_substitutions(&self) -> &str {
        &self.after_substitutions
    }

    /// Walk a layer's `built` chain to its ultimate non-built ancestor.
    ///
    /// The recipe parser rejects cycles, so the walk is bounded by the
    /// number of layers.
    pub fn base_of<'a>(&'a self, layer: &'a Layer) -> Result<&'a Layer> {
        let mut current = layer;
        for _ in 0..=self.layers.len() {
            if current.from.source_type != SourceType::Built {
                return Ok(current);
            }
            current = self.layers.get(&current.from.tag).ok_or_else(|| {
                StrataError::RecipeError(format!("missing base layer {}?", current.from.tag))
            })?;
        }
        Err(StrataError::RecipeError(
            "built chain does not terminate".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_docker_and_oci() {
        let docker = ImageSource::docker("docker://alpine:3.14");
        assert_eq!(docker.parse_tag().unwrap(), "alpine");

        let oci = ImageSource::oci("/srv/images:web");
        assert_eq!(oci.parse_tag().unwrap(), "web");
    }

    #[test]
    fn test_parse_tag_rejects_other_sources() {
        assert!(ImageSource::scratch().parse_tag().is_err());
        assert!(ImageSource::built("base").parse_tag().is_err());
    }

    #[test]
    fn test_recipe_order_and_get() {
        let recipe = Recipe::new(
            vec![
                ("base".to_string(), Layer::default()),
                (
                    "top".to_string(),
                    Layer {
                        from: ImageSource::built("base"),
                        ..Default::default()
                    },
                ),
            ],
            "base: {}\ntop: {}",
        );

        assert_eq!(recipe.build_order(), &["base".to_string(), "top".to_string()]);
        assert!(recipe.get("base").is_some());
        assert!(recipe.get("missing").is_none());
    }

    #[test]
    fn test_base_of_walks_built_chain() {
        let recipe = Recipe::new(
            vec![
                (
                    "a".to_string(),
                    Layer {
                        from: ImageSource::docker("docker://alpine:3.14"),
                        build_only: true,
                        ..Default::default()
                    },
                ),
                (
                    "b".to_string(),
                    Layer {
                        from: ImageSource::built("a"),
                        ..Default::default()
                    },
                ),
                (
                    "c".to_string(),
                    Layer {
                        from: ImageSource::built("b"),
                        ..Default::default()
                    },
                ),
            ],
            "",
        );

        let leaf = recipe.get("c").unwrap();
        let base = recipe.base_of(leaf).unwrap();
        assert_eq!(base.from.source_type, SourceType::Docker);
        assert!(base.build_only);
    }

    #[test]
    fn test_base_of_missing_parent() {
        let recipe = Recipe::new(
            vec![(
                "orphan".to_string(),
                Layer {
                    from: ImageSource::built("ghost"),
                    ..Default::default()
                },
            )],
            "",
        );

        let layer = recipe.get("orphan").unwrap();
        assert!(matches!(
            recipe.base_of(layer),
            Err(StrataError::RecipeError(_))
        ));
    }

    #[test]
    fn test_layer_serialization_is_deterministic() {
        let mut layer = Layer::default();
        layer.environment.insert("B".to_string(), "2".to_string());
        layer.environment.insert("A".to_string(), "1".to_string());
        layer.run.push("touch /foo".to_string());

        let first = serde_json::to_string(&layer).unwrap();
        let second = serde_json::to_string(&layer).unwrap();
        assert_eq!(first, second);
        // BTreeMap keys serialize sorted
        assert!(first.find("\"A\"").unwrap() < first.find("\"B\"").unwrap());
    }
}
