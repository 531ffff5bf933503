//! Command-line options.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ci_mirror_core::config::{LogFormat, MirrorConfig};
use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::OverrideSets;

/// The only controller this binary knows how to run.
pub const DISTRIBUTOR_CONTROLLER: &str = "quay_io_ci_images_distributor";

const KNOWN_CONTROLLERS: &[&str] = &[DISTRIBUTOR_CONTROLLER];

#[derive(Parser, Debug, Clone)]
#[command(name = "ci-images-mirror")]
#[command(about = "Mirror CI image stream tags into an external registry")]
#[command(version)]
pub struct Options {
    /// Path to the release repository checkout
    #[arg(long)]
    pub release_repo_git_sync_path: PathBuf,

    /// Docker config.json holding registry credentials
    #[arg(long)]
    pub registry_config: PathBuf,

    /// Record mirror actions without pushing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Port the query API listens on
    #[arg(long, default_value_t = 8090)]
    pub port: u16,

    /// Time in-flight work is given on shutdown (e.g. 10s, 1m)
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub grace_period: Duration,

    /// Namespace holding the leader election lease
    #[arg(long, default_value = "ci")]
    pub leader_election_namespace: String,

    /// Suffix appended to the lease name, only allowed with --dry-run
    #[arg(long, allow_hyphen_values = true)]
    pub leader_election_suffix: Option<String>,

    /// Controllers to run
    #[arg(long = "enable-controller", default_value = DISTRIBUTOR_CONTROLLER)]
    pub enable_controllers: Vec<String>,

    /// Image stream tag (namespace/name:tag) that is always mirrored
    #[arg(long = "additional-image-stream-tag")]
    pub additional_image_stream_tags: Vec<String>,

    /// Image stream (namespace/name) whose tags are always mirrored
    #[arg(long = "additional-image-stream")]
    pub additional_image_streams: Vec<String>,

    /// Namespace whose image streams are always mirrored
    #[arg(long = "additional-image-stream-namespace")]
    pub additional_image_stream_namespaces: Vec<String>,

    /// Registry serving the source image streams
    #[arg(long, default_value = "registry.ci.openshift.org")]
    pub source_registry: String,

    /// Name of the cluster the source image streams live on
    #[arg(long, default_value = "app.ci")]
    pub source_cluster: String,

    /// Repository mirrored tags are pushed into
    #[arg(long, default_value = "quay.io/openshift/ci")]
    pub destination_repository: String,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Number of mirror records kept for the query API
    #[arg(long, default_value_t = 1000)]
    pub retention: usize,

    /// Log output format (text, json)
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,
}

impl Options {
    /// Whether the mirroring controller was enabled.
    pub fn controller_enabled(&self) -> bool {
        self.enable_controllers
            .iter()
            .any(|name| name == DISTRIBUTOR_CONTROLLER)
    }

    /// Name of the lease used for leader election.
    pub fn lease_name(&self) -> String {
        format!(
            "ci-image-mirror{}",
            self.leader_election_suffix.as_deref().unwrap_or_default()
        )
    }

    /// Check the options and build the controller configuration. Every
    /// problem is reported at once.
    pub fn into_config(&self) -> Result<MirrorConfig> {
        let mut errors = Vec::new();

        if self.release_repo_git_sync_path.as_os_str().is_empty() {
            errors.push(MirrorError::ConfigError(
                "--release-repo-git-sync-path is required".to_string(),
            ));
        }
        if self.registry_config.as_os_str().is_empty() {
            errors.push(MirrorError::ConfigError(
                "--registry-config is required".to_string(),
            ));
        }
        if self.leader_election_suffix.is_some() && !self.dry_run {
            errors.push(MirrorError::ConfigError(
                "--leader-election-suffix requires --dry-run".to_string(),
            ));
        }
        for name in &self.enable_controllers {
            if !KNOWN_CONTROLLERS.contains(&name.as_str()) {
                errors.push(MirrorError::ConfigError(format!(
                    "unknown controller '{}' (known: {})",
                    name,
                    KNOWN_CONTROLLERS.join(", ")
                )));
            }
        }

        let overrides = match OverrideSets::from_raw(
            self.additional_image_stream_tags.iter().cloned(),
            self.additional_image_streams.iter().cloned(),
            self.additional_image_stream_namespaces.iter().cloned(),
        ) {
            Ok(overrides) => overrides,
            Err(e) => {
                flatten_into(e, &mut errors);
                OverrideSets::default()
            }
        };

        let config = MirrorConfig {
            dry_run: self.dry_run,
            source_registry: self.source_registry.clone(),
            source_cluster: self.source_cluster.clone(),
            destination_repository: self.destination_repository.clone(),
            workers: self.workers,
            retention: self.retention,
            grace_period_secs: self.grace_period.as_secs(),
            overrides,
            ..MirrorConfig::default()
        };
        if let Err(e) = config.validate() {
            flatten_into(e, &mut errors);
        }

        match MirrorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(config),
        }
    }
}

fn flatten_into(error: MirrorError, errors: &mut Vec<MirrorError>) {
    match error {
        MirrorError::Aggregate(inner) => errors.extend(inner),
        other => errors.push(other),
    }
}

/// Parse a duration such as `10s`, `500ms`, `2m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;

    match unit {
        "" | "s" => Ok(Duration::from_secs(number)),
        "ms" => Ok(Duration::from_millis(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(format!(
            "invalid duration unit '{}' in '{}' (supported: ms, s, m, h)",
            unit, value
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let mut argv = vec![
            "ci-images-mirror",
            "--release-repo-git-sync-path",
            "/release",
            "--registry-config",
            "/auth/config.json",
        ];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = parse(&[]);
        assert_eq!(options.port, 8090);
        assert_eq!(options.grace_period, Duration::from_secs(10));
        assert_eq!(options.leader_election_namespace, "ci");
        assert_eq!(options.lease_name(), "ci-image-mirror");
        assert_eq!(options.log_format, LogFormat::Text);
        assert!(options.controller_enabled());
        assert_eq!(options.enable_controllers, vec![DISTRIBUTOR_CONTROLLER.to_string()]);

        let config = options.into_config().unwrap();
        assert!(!config.dry_run);
        assert_eq!(config.workers, 4);
        assert_eq!(config.grace_period_secs, 10);
    }

    #[test]
    fn test_required_paths() {
        let result = Options::try_parse_from(["ci-images-mirror", "--registry-config", "/a"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_and_controller() {
        let options = parse(&[
            "--enable-controller",
            DISTRIBUTOR_CONTROLLER,
            "--additional-image-stream-tag",
            "ci/clonerefs:latest",
            "--additional-image-stream",
            "ci/ci-tools",
            "--additional-image-stream-namespace",
            "origin",
            "--log-format",
            "json",
        ]);
        assert!(options.controller_enabled());
        assert_eq!(options.log_format, LogFormat::Json);

        let config = options.into_config().unwrap();
        assert_eq!(config.overrides.tag_references().len(), 1);
        assert!(!config.overrides.is_empty());
    }

    #[test]
    fn test_every_problem_is_reported() {
        let options = parse(&[
            "--leader-election-suffix",
            "-test",
            "--enable-controller",
            "nope",
            "--additional-image-stream-tag",
            "not-a-tag",
            "--workers",
            "0",
        ]);
        match options.into_config().unwrap_err() {
            MirrorError::Aggregate(errors) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                let text = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                assert!(text.contains("--leader-election-suffix requires --dry-run"));
                assert!(text.contains("unknown controller 'nope'"));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_suffix_allowed_with_dry_run() {
        let options = parse(&["--dry-run", "--leader-election-suffix", "-dev"]);
        assert_eq!(options.lease_name(), "ci-image-mirror-dev");
        assert!(options.into_config().unwrap().dry_run);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
    }
}
