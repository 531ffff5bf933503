//! Multi-stage test resolution against the step registry.
//!
//! Expands `steps` (references to registry steps, chains and workflows) into
//! `literal_steps`. Tests that cannot be fully expanded keep their unresolved
//! form so the reference resolver reports them.

use std::collections::HashMap;

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::pipeline::{
    LiteralTestStep, MultiStageTestConfiguration, MultiStageTestConfigurationLiteral, Observer,
    ReleaseBuildConfiguration, TestStep, TestStepConfiguration,
};

/// Chains nested deeper than this are treated as cyclic.
const MAX_CHAIN_DEPTH: usize = 16;

/// Read access to the step registry.
pub trait StepRegistry: Send + Sync {
    fn reference(&self, name: &str) -> Option<LiteralTestStep>;
    fn chain(&self, name: &str) -> Option<Vec<TestStep>>;
    fn workflow(&self, name: &str) -> Option<MultiStageTestConfiguration>;
    fn observer(&self, name: &str) -> Option<Observer>;
}

/// In-memory step registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    pub references: HashMap<String, LiteralTestStep>,
    pub chains: HashMap<String, Vec<TestStep>>,
    pub workflows: HashMap<String, MultiStageTestConfiguration>,
    pub observers: HashMap<String, Observer>,
}

impl RegistryIndex {
    pub fn len(&self) -> usize {
        self.references.len() + self.chains.len() + self.workflows.len() + self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StepRegistry for RegistryIndex {
    fn reference(&self, name: &str) -> Option<LiteralTestStep> {
        self.references.get(name).cloned()
    }

    fn chain(&self, name: &str) -> Option<Vec<TestStep>> {
        self.chains.get(name).cloned()
    }

    fn workflow(&self, name: &str) -> Option<MultiStageTestConfiguration> {
        self.workflows.get(name).cloned()
    }

    fn observer(&self, name: &str) -> Option<Observer> {
        self.observers.get(name).cloned()
    }
}

/// Expand one unresolved multi-stage test into its literal form.
///
/// Phases the test leaves empty are taken from its workflow. All lookup
/// failures are collected; any failure makes the whole test unresolvable.
pub fn resolve_multi_stage(
    test: &MultiStageTestConfiguration,
    registry: &dyn StepRegistry,
) -> Result<MultiStageTestConfigurationLiteral> {
    let mut errors = Vec::new();

    let workflow = match &test.workflow {
        Some(name) => {
            let workflow = registry.workflow(name);
            if workflow.is_none() {
                errors.push(MirrorError::StepRegistryError(format!(
                    "workflow {} not found",
                    name
                )));
            }
            workflow
        }
        None => None,
    };

    let phase = |own: &Vec<TestStep>, inherited: Option<&Vec<TestStep>>| -> Vec<TestStep> {
        if own.is_empty() {
            inherited.cloned().unwrap_or_default()
        } else {
            own.clone()
        }
    };
    let pre = phase(&test.pre, workflow.as_ref().map(|w| &w.pre));
    let main = phase(&test.test, workflow.as_ref().map(|w| &w.test));
    let post = phase(&test.post, workflow.as_ref().map(|w| &w.post));

    let mut literal = MultiStageTestConfigurationLiteral::default();
    expand(&pre, registry, 0, &mut literal.pre, &mut errors);
    expand(&main, registry, 0, &mut literal.test, &mut errors);
    expand(&post, registry, 0, &mut literal.post, &mut errors);

    for name in observer_names(test, workflow.as_ref()) {
        match registry.observer(&name) {
            Some(observer) => literal.observers.push(observer),
            None => errors.push(MirrorError::StepRegistryError(format!(
                "observer {} not found",
                name
            ))),
        }
    }

    match MirrorError::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(literal),
    }
}

/// Workflow observers plus the test's own, minus the ones it disables.
fn observer_names(
    test: &MultiStageTestConfiguration,
    workflow: Option<&MultiStageTestConfiguration>,
) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let enabled = workflow
        .and_then(|w| w.observers.as_ref())
        .into_iter()
        .chain(test.observers.as_ref())
        .flat_map(|o| o.enable.iter());
    for name in enabled {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    if let Some(observers) = &test.observers {
        names.retain(|name| !observers.disable.contains(name));
    }
    names
}

fn expand(
    steps: &[TestStep],
    registry: &dyn StepRegistry,
    depth: usize,
    out: &mut Vec<LiteralTestStep>,
    errors: &mut Vec<MirrorError>,
) {
    if depth > MAX_CHAIN_DEPTH {
        errors.push(MirrorError::StepRegistryError(format!(
            "chains nested deeper than {}",
            MAX_CHAIN_DEPTH
        )));
        return;
    }
    for step in steps {
        match step {
            TestStep::Literal(literal) => out.push(literal.clone()),
            TestStep::Reference { reference } => match registry.reference(reference) {
                Some(literal) => out.push(literal),
                None => errors.push(MirrorError::StepRegistryError(format!(
                    "reference {} not found",
                    reference
                ))),
            },
            TestStep::Chain { chain } => match registry.chain(chain) {
                Some(steps) => expand(&steps, registry, depth + 1, out, errors),
                None => errors.push(MirrorError::StepRegistryError(format!(
                    "chain {} not found",
                    chain
                ))),
            },
        }
    }
}

fn resolve_test(
    test: &mut TestStepConfiguration,
    registry: &dyn StepRegistry,
    errors: &mut Vec<MirrorError>,
) {
    if test.multi_stage_literal.is_some() {
        return;
    }
    let Some(unresolved) = &test.multi_stage else {
        return;
    };
    match resolve_multi_stage(unresolved, registry) {
        Ok(literal) => {
            test.multi_stage_literal = Some(literal);
            test.multi_stage = None;
        }
        Err(e) => errors.push(MirrorError::StepRegistryError(format!(
            "test {}: {}",
            test.as_name, e
        ))),
    }
}

/// Resolve every test and raw test step of `config`.
///
/// Returns the resolved copy together with the lookup errors, if any. Tests
/// that failed to resolve are left in their unresolved form.
pub fn resolve_config(
    config: &ReleaseBuildConfiguration,
    registry: &dyn StepRegistry,
) -> (ReleaseBuildConfiguration, Option<MirrorError>) {
    let mut resolved = config.clone();
    let mut errors = Vec::new();

    for test in &mut resolved.tests {
        resolve_test(test, registry, &mut errors);
    }
    for raw in &mut resolved.raw_steps {
        if let Some(test) = &mut raw.test_step {
            resolve_test(test, registry, &mut errors);
        }
    }

    (resolved, MirrorError::aggregate(errors))
}
