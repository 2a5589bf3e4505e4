//! Supervises one crawler/parser pair per enabled chain.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::config::{ChainConfig, LedgerConfig};
use crate::crawler::{Crawler, CrawlerConfig, CrawlerState};
use crate::decode::Decoder;
use crate::error::LedgerError;
use crate::parser::{Parser, ParserConfig};
use crate::peer::PeerAdapter;
use crate::queue::JobQueue;
use crate::store::ChainStore;

/// The crawler and parser of one chain, sharing a store and a queue.
pub struct ChainPipeline {
    pub chain_id: String,
    pub crawler: Arc<Crawler>,
    pub parser: Arc<Parser>,
}

impl ChainPipeline {
    pub fn new(
        config: &ChainConfig,
        peer: Arc<dyn PeerAdapter>,
        decoder: Arc<dyn Decoder>,
        store: Arc<dyn ChainStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let crawler = Crawler::new(CrawlerConfig::from(config), peer, store.clone(), queue.clone());
        let parser = Parser::new(ParserConfig::from(config), store, queue, decoder);
        Self {
            chain_id: config.id.clone(),
            crawler: Arc::new(crawler),
            parser: Arc::new(parser),
        }
    }
}

/// Builds the chain-family parts of a pipeline.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, config: &ChainConfig) -> Result<ChainPipeline, LedgerError>;
}

/// Snapshot of one pipeline for status output.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub chain_id: String,
    pub crawler: CrawlerState,
    pub parser_running: bool,
}

/// Owns every pipeline of the process.
#[derive(Default)]
pub struct Manager {
    pipelines: Vec<ChainPipeline>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// One pipeline per enabled chain. A chain that cannot be built is logged
    /// and skipped; the others still run.
    pub fn from_config(config: &LedgerConfig, factory: &dyn PipelineFactory) -> Self {
        let mut manager = Self::new();
        for chain in config.enabled_chains() {
            match factory.build(chain) {
                Ok(pipeline) => manager.add(pipeline),
                Err(e) => tracing::error!(chain = %chain.id, error = %e, "Pipeline not started"),
            }
        }
        manager
    }

    pub fn add(&mut self, pipeline: ChainPipeline) {
        self.pipelines.push(pipeline);
    }

    pub fn pipelines(&self) -> &[ChainPipeline] {
        &self.pipelines
    }

    pub fn chain_ids(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.chain_id.as_str()).collect()
    }

    /// Start every parser, then every crawler. Returns how many pipelines started.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for p in &self.pipelines {
            p.parser.start();
            if p.crawler.start() {
                started += 1;
            }
        }
        tracing::info!(pipelines = started, "Pipelines started");
        started
    }

    /// Stop crawlers first so no new jobs are published, then drain parsers.
    pub async fn stop_all(&self) {
        join_all(self.pipelines.iter().map(|p| p.crawler.stop())).await;
        join_all(self.pipelines.iter().map(|p| p.parser.stop())).await;
        tracing::info!(pipelines = self.pipelines.len(), "Pipelines stopped");
    }

    pub fn status(&self) -> Vec<PipelineStatus> {
        self.pipelines
            .iter()
            .map(|p| PipelineStatus {
                chain_id: p.chain_id.clone(),
                crawler: p.crawler.state(),
                parser_running: p.parser.is_started(),
            })
            .collect()
    }
}
