//! Image reference resolution.
//!
//! Turns pipeline configurations into the set of image tags that must exist
//! in the mirror. Pure: no network or cluster access.
//!
//! Every place a configuration can name an image is first normalised into an
//! [`ImageSource`]; a single routine then walks those sources. Test steps and
//! materialized raw steps go through the same path.

use ci_mirror_core::error::MirrorError;
use ci_mirror_core::pipeline::{
    MultiStageTestConfigurationLiteral, ReleaseBuildConfiguration, TestStepConfiguration,
};
use ci_mirror_core::reference::{ImageReference, OverrideSets, ReferenceSet};

/// Where an image reference comes from, in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource<'a> {
    /// A reference named directly by the configuration.
    Direct(ImageReference),
    /// A resolved multi-stage test; every sub-step and observer may name an image.
    Steps(&'a MultiStageTestConfigurationLiteral),
    /// A multi-stage test that was never expanded.
    Unresolved { test: &'a str },
}

/// Output of a resolution pass: the references found and the errors met on
/// the way. The references are usable even when `error` is set; they are
/// simply incomplete.
#[derive(Debug, Default)]
pub struct Resolution {
    pub references: ReferenceSet,
    pub error: Option<MirrorError>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

fn test_source(test: &TestStepConfiguration) -> Option<ImageSource<'_>> {
    match (&test.multi_stage_literal, &test.multi_stage) {
        (Some(literal), _) => Some(ImageSource::Steps(literal)),
        (None, Some(_)) => Some(ImageSource::Unresolved {
            test: &test.as_name,
        }),
        (None, None) => None,
    }
}

/// List every image source of a configuration.
pub fn image_sources(config: &ReleaseBuildConfiguration) -> Vec<ImageSource<'_>> {
    let mut sources = Vec::new();

    if let Some(tag_spec) = &config.release_tag_configuration {
        sources.push(ImageSource::Direct(ImageReference::stream(
            &tag_spec.namespace,
            &tag_spec.name,
        )));
    }
    for release in config.releases.values() {
        if let Some(integration) = &release.integration {
            sources.push(ImageSource::Direct(ImageReference::stream(
                &integration.namespace,
                &integration.name,
            )));
        }
    }

    sources.extend(
        config
            .base_images
            .values()
            .chain(config.base_rpm_images.values())
            .cloned()
            .map(ImageSource::Direct),
    );

    if let Some(build_root) = &config.build_root {
        if let Some(tag) = &build_root.image_stream_tag {
            sources.push(ImageSource::Direct(tag.clone()));
        }
        if build_root.use_build_cache {
            sources.push(ImageSource::Direct(
                config.metadata.build_cache_reference(),
            ));
        }
    }

    sources.extend(config.tests.iter().filter_map(test_source));

    for raw in &config.raw_steps {
        if let Some(step) = &raw.input_image_tag_step {
            sources.push(ImageSource::Direct(step.base_image.clone()));
        }
        if let Some(step) = &raw.source_step {
            sources.push(ImageSource::Direct(step.clonerefs_image.clone()));
        }
        if let Some(test) = raw.test_step.as_ref().and_then(test_source) {
            sources.push(test);
        }
    }

    sources
}

fn insert_steps(literal: &MultiStageTestConfigurationLiteral, references: &mut ReferenceSet) {
    let steps = literal.pre.iter().chain(&literal.test).chain(&literal.post);
    for image in steps.filter_map(|step| step.from_image.as_ref()) {
        references.insert(image.clone());
    }
    for image in literal.observers.iter().filter_map(|o| o.from_image.as_ref()) {
        references.insert(image.clone());
    }
}

/// Every image reference required by one configuration.
///
/// Unresolved multi-stage tests do not stop the walk; each one adds a
/// "got unresolved config" error to the combined error.
pub fn resolve_references(config: &ReleaseBuildConfiguration) -> Resolution {
    let mut references = ReferenceSet::new();
    let mut errors = Vec::new();

    for source in image_sources(config) {
        match source {
            ImageSource::Direct(reference) => {
                references.insert(reference);
            }
            ImageSource::Steps(literal) => insert_steps(literal, &mut references),
            ImageSource::Unresolved { test } => errors.push(MirrorError::UnresolvedConfig {
                test: test.to_string(),
            }),
        }
    }

    Resolution {
        references,
        error: MirrorError::aggregate(errors),
    }
}

/// The desired-reference set: every configuration's references, merged in
/// order, followed by the explicit override tags. First write wins.
pub fn desired_references(
    configs: &[ReleaseBuildConfiguration],
    overrides: &OverrideSets,
) -> Resolution {
    let mut references = ReferenceSet::new();
    let mut errors = Vec::new();

    for config in configs {
        let resolution = resolve_references(config);
        references.merge(&resolution.references);
        if let Some(e) = resolution.error {
            errors.push(MirrorError::ConfigError(format!("{}: {}", config.metadata, e)));
        }
    }
    references.merge(&overrides.tag_references());

    Resolution {
        references,
        error: MirrorError::aggregate(errors),
    }
}
