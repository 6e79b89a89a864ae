use std::sync::Arc;

use article_datastore::DataStore;

use crate::{
    config::{EngineConfig, RetryPolicy},
    llm::gateway::AgentGateway,
    jobs::JobManager,
};

pub struct JobManagerBuilder<D = (), G = ()> {
    store: D,
    gateway: G,
    config: EngineConfig,
}

impl JobManagerBuilder {
    pub fn new() -> Self {
        Self {
            store: (),
            gateway: (),
            config: EngineConfig::default(),
        }
    }
}

impl Default for JobManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, G> JobManagerBuilder<D, G> {
    pub fn store<D2: DataStore + Send + Sync + 'static>(self, store: D2) -> JobManagerBuilder<D2, G> {
        JobManagerBuilder {
            store,
            gateway: self.gateway,
            config: self.config,
        }
    }

    pub fn gateway<G2: AgentGateway + Send + Sync + 'static>(
        self,
        gateway: G2,
    ) -> JobManagerBuilder<D, G2> {
        JobManagerBuilder {
            store: self.store,
            gateway,
            config: self.config,
        }
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

impl<D, G> JobManagerBuilder<D, G>
where
    D: DataStore + Send + Sync + 'static,
    G: AgentGateway + Send + Sync + 'static,
{
    pub fn build(self) -> JobManager<D, G> {
        JobManager::new(Arc::new(self.store), Arc::new(self.gateway), self.config)
    }
}
