//! Pipeline configuration model.
//!
//! A read-only subset of the ci-operator `ReleaseBuildConfiguration` covering
//! every field that can name an image. Field names follow the YAML documents
//! found in the release repository; unknown fields are ignored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;

/// Namespace holding build-cache image streams.
pub const BUILD_CACHE_NAMESPACE: &str = "build-cache";

/// Identity of the repository and branch a configuration belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Metadata {
    /// Build-cache tag for this repository: `build-cache/<org>-<repo>:<branch>`.
    pub fn build_cache_reference(&self) -> ImageReference {
        ImageReference::new(
            BUILD_CACHE_NAMESPACE,
            format!("{}-{}", self.org, self.repo),
            self.branch.clone(),
        )
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.org, self.repo, self.branch)?;
        if !self.variant.is_empty() {
            write!(f, "__{}", self.variant)?;
        }
        Ok(())
    }
}

/// Stream the release payload is assembled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTagConfiguration {
    pub namespace: String,
    pub name: String,
}

/// Integration stream backing a named release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedRelease {
    #[serde(default)]
    pub integration: Option<Integration>,
}

/// Image the build root is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRootImageConfiguration {
    #[serde(default)]
    pub image_stream_tag: Option<ImageReference>,
    #[serde(default)]
    pub from_repository: bool,
    #[serde(default)]
    pub use_build_cache: bool,
}

/// A fully specified step of a multi-stage test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralTestStep {
    #[serde(rename = "as")]
    pub as_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default)]
    pub from_image: Option<ImageReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commands: String,
}

/// A process running alongside every step of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observer {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default)]
    pub from_image: Option<ImageReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commands: String,
}

/// Multi-stage test with every registry reference expanded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStageTestConfigurationLiteral {
    #[serde(default)]
    pub pre: Vec<LiteralTestStep>,
    #[serde(default)]
    pub test: Vec<LiteralTestStep>,
    #[serde(default)]
    pub post: Vec<LiteralTestStep>,
    #[serde(default)]
    pub observers: Vec<Observer>,
}

/// An entry of an unresolved multi-stage phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestStep {
    /// Reference to a registry step by name.
    Reference {
        #[serde(rename = "ref")]
        reference: String,
    },
    /// Reference to a registry chain by name.
    Chain { chain: String },
    /// Inline step.
    Literal(LiteralTestStep),
}

/// Observers enabled or disabled on top of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observers {
    #[serde(default)]
    pub enable: Vec<String>,
    #[serde(default)]
    pub disable: Vec<String>,
}

/// Multi-stage test still referring to the step registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStageTestConfiguration {
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub pre: Vec<TestStep>,
    #[serde(default)]
    pub test: Vec<TestStep>,
    #[serde(default)]
    pub post: Vec<TestStep>,
    #[serde(default)]
    pub observers: Option<Observers>,
}

/// One entry of `tests`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStepConfiguration {
    #[serde(rename = "as")]
    pub as_name: String,
    #[serde(default, rename = "steps")]
    pub multi_stage: Option<MultiStageTestConfiguration>,
    #[serde(default, rename = "literal_steps")]
    pub multi_stage_literal: Option<MultiStageTestConfigurationLiteral>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputImageTagStepConfiguration {
    pub base_image: ImageReference,
    #[serde(default)]
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStepConfiguration {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub clonerefs_image: ImageReference,
    #[serde(default)]
    pub clonerefs_path: String,
}

/// Materialized step; exactly one field is normally set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfiguration {
    #[serde(default)]
    pub input_image_tag_step: Option<InputImageTagStepConfiguration>,
    #[serde(default)]
    pub source_step: Option<SourceStepConfiguration>,
    #[serde(default)]
    pub test_step: Option<TestStepConfiguration>,
}

/// The subset of a ci-operator configuration that references images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBuildConfiguration {
    #[serde(default, rename = "zz_generated_metadata")]
    pub metadata: Metadata,
    #[serde(default, rename = "tag_specification")]
    pub release_tag_configuration: Option<ReleaseTagConfiguration>,
    #[serde(default)]
    pub releases: BTreeMap<String, UnresolvedRelease>,
    #[serde(default)]
    pub build_root: Option<BuildRootImageConfiguration>,
    #[serde(default)]
    pub base_images: BTreeMap<String, ImageReference>,
    #[serde(default)]
    pub base_rpm_images: BTreeMap<String, ImageReference>,
    #[serde(default)]
    pub tests: Vec<TestStepConfiguration>,
    #[serde(default)]
    pub raw_steps: Vec<StepConfiguration>,
}

impl ReleaseBuildConfiguration {
    /// Parse a configuration document (YAML, which also accepts JSON).
    pub fn from_yaml(data: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
zz_generated_metadata:
  org: openshift
  repo: ci-tools
  branch: master
tag_specification:
  namespace: ocp
  name: "4.15"
releases:
  latest:
    integration:
      namespace: ocp
      name: "4.16"
  initial:
    candidate:
      product: ocp
build_root:
  use_build_cache: true
  image_stream_tag:
    namespace: openshift
    name: release
    tag: golang-1.21
base_images:
  os:
    namespace: ocp
    name: builder
    tag: rhel-9
tests:
- as: unit
  commands: make test
- as: e2e
  steps:
    workflow: ipi-aws
    test:
    - ref: e2e-test
    - chain: gather
    - as: inline
      from_image:
        namespace: ci
        name: tools
        tag: latest
      commands: run
- as: literal
  literal_steps:
    test:
    - as: step
      from_image:
        namespace: n2
        name: img
        tag: latest
      commands: run
"#;

    #[test]
    fn test_parse_config() {
        let cfg = ReleaseBuildConfiguration::from_yaml(CONFIG).unwrap();
        assert_eq!(cfg.metadata.org, "openshift");
        assert_eq!(cfg.release_tag_configuration.as_ref().unwrap().name, "4.15");
        assert_eq!(cfg.releases.len(), 2);
        assert!(cfg.releases["initial"].integration.is_none());
        assert!(cfg.build_root.as_ref().unwrap().use_build_cache);
        assert_eq!(cfg.base_images["os"].tag, "rhel-9");
        assert_eq!(cfg.tests.len(), 3);
    }

    #[test]
    fn test_parse_test_step_variants() {
        let cfg = ReleaseBuildConfiguration::from_yaml(CONFIG).unwrap();
        let steps = cfg.tests[1].multi_stage.as_ref().unwrap();
        assert_eq!(steps.workflow.as_deref(), Some("ipi-aws"));
        assert!(matches!(&steps.test[0], TestStep::Reference { reference } if reference == "e2e-test"));
        assert!(matches!(&steps.test[1], TestStep::Chain { chain } if chain == "gather"));
        match &steps.test[2] {
            TestStep::Literal(step) => {
                assert_eq!(step.as_name, "inline");
                assert_eq!(step.from_image.as_ref().unwrap().key(), "ci/tools:latest");
            }
            other => panic!("expected literal step, got {other:?}"),
        }
        assert!(cfg.tests[2].multi_stage_literal.is_some());
    }

    #[test]
    fn test_build_cache_reference() {
        let metadata = Metadata {
            org: "openshift".to_string(),
            repo: "ci-tools".to_string(),
            branch: "master".to_string(),
            variant: String::new(),
        };
        assert_eq!(
            metadata.build_cache_reference().key(),
            "build-cache/openshift-ci-tools:master"
        );
    }

    #[test]
    fn test_metadata_display_with_variant() {
        let metadata = Metadata {
            org: "o".to_string(),
            repo: "r".to_string(),
            branch: "b".to_string(),
            variant: "v".to_string(),
        };
        assert_eq!(metadata.to_string(), "o/r@b__v");
    }

    #[test]
    fn test_parse_raw_steps() {
        let cfg = ReleaseBuildConfiguration::from_yaml(
            r#"
raw_steps:
- input_image_tag_step:
    base_image:
      namespace: ocp
      name: builder
      tag: golang
    to: root
- source_step:
    from: root
    to: src
    clonerefs_image:
      namespace: ci
      name: clonerefs
      tag: latest
    clonerefs_path: /clonerefs
"#,
        )
        .unwrap();
        assert_eq!(cfg.raw_steps.len(), 2);
        assert!(cfg.raw_steps[0].input_image_tag_step.is_some());
        assert_eq!(
            cfg.raw_steps[1].source_step.as_ref().unwrap().clonerefs_image.name,
            "clonerefs"
        );
    }
}
