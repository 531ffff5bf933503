//! Pipeline configuration sources.

use parking_lot::RwLock;
use tokio::sync::watch;

use ci_mirror_core::error::Result;
use ci_mirror_core::pipeline::ReleaseBuildConfiguration;

/// Supplies the current pipeline configurations.
///
/// The generation published through [`ConfigProvider::subscribe`] changes
/// whenever `configs` would return something different.
pub trait ConfigProvider: Send + Sync {
    fn configs(&self) -> Result<Vec<ReleaseBuildConfiguration>>;

    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-memory provider; [`StaticConfigProvider::replace`] bumps the generation.
pub struct StaticConfigProvider {
    configs: RwLock<Vec<ReleaseBuildConfiguration>>,
    generation: watch::Sender<u64>,
}

impl StaticConfigProvider {
    pub fn new(configs: Vec<ReleaseBuildConfiguration>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            configs: RwLock::new(configs),
            generation,
        }
    }

    pub fn replace(&self, configs: Vec<ReleaseBuildConfiguration>) {
        *self.configs.write() = configs;
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn configs(&self) -> Result<Vec<ReleaseBuildConfiguration>> {
        Ok(self.configs.read().clone())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_bumps_generation() {
        let provider = StaticConfigProvider::new(Vec::new());
        let mut rx = provider.subscribe();
        assert_eq!(provider.generation(), 0);

        provider.replace(vec![ReleaseBuildConfiguration::default()]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(provider.configs().unwrap().len(), 1);
    }
}
