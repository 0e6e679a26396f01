use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    store::Database,
};

pub struct CacheSaveTask {
    db: Arc<Database>,
}

impl CacheSaveTask {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CacheSaveTask {
    fn name(&self) -> &'static str {
        "cache-save"
    }

    fn interval(&self) -> Duration {
        self.db.config.scheduler.cache_save_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // maps first so a crash never leaves a cache newer than its files
        self.db.save_maps().await?;
        self.db.save_cache().await
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.db.save().await
    }
}

pub struct MetricsTask {
    db: Arc<Database>,
}

impl MetricsTask {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.db.config.scheduler.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.db.collect_metrics()
    }
}
