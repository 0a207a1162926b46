//! Builds the application state from configuration and starts the background tasks.

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::background::BackgroundPool;
use crate::core::cache::{MemoryTagCache, TagCache};
use crate::core::config::AppConfig;
use crate::core::scheduler::IntervalJob;
use crate::core::shared::state::AppState;
use crate::core::shared::utils::{create_conn, run_migrations};
use crate::core::upstream::{
    AttachmentService, CommunityDirectory, FileClient, IdentityClient, NewsSource, PushClient, PushGateway,
    ReaderClient, SocialGraph, UpstreamClient,
};
use crate::social::composer::PostComposer;
use crate::social::context::SocialContextResolver;
use crate::social::feed::FeedAggregator;
use crate::social::lifecycle::PostLifecycle;
use crate::social::notifier::SubscriptionNotifier;
use crate::social::store::{ContentStore, PgContentStore};
use crate::social::views::spawn_view_flusher;

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Storage, cache and upstream implementations the service runs against.
pub struct Backends {
    pub store: Arc<dyn ContentStore>,
    pub cache: Arc<dyn TagCache>,
    pub graph: Arc<dyn SocialGraph>,
    pub communities: Arc<dyn CommunityDirectory>,
    pub attachments: Arc<dyn AttachmentService>,
    pub news: Arc<dyn NewsSource>,
    pub push: Arc<dyn PushGateway>,
}

/// A running application: shared state plus the tasks started alongside it.
pub struct Runtime {
    pub state: Arc<AppState>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Stops the scheduled jobs, flushes pending views and lets queued background
    /// work drain once the last handle to the state is gone.
    pub async fn stop(self) {
        let Runtime {
            state,
            shutdown,
            tasks,
            workers,
        } = self;
        shutdown.cancel();
        join_all(tasks).await;
        drop(state);
        if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, join_all(workers)).await.is_err() {
            warn!("Background workers did not drain within {:?}", WORKER_DRAIN_TIMEOUT);
        }
        info!("Runtime stopped");
    }
}

fn create_cache(config: &AppConfig) -> anyhow::Result<Arc<dyn TagCache>> {
    #[cfg(feature = "cache")]
    {
        if let Some(url) = &config.redis_url {
            let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
            info!("Using Redis cache");
            return Ok(Arc::new(crate::core::cache::RedisTagCache::new(Arc::new(client))));
        }
    }
    #[cfg(not(feature = "cache"))]
    {
        if config.redis_url.is_some() {
            warn!("REDIS_URL is set but the cache feature is disabled, using in-process cache");
        }
    }
    info!("Using in-process cache");
    Ok(Arc::new(MemoryTagCache::new()))
}

/// Connects to Postgres, applies migrations and builds the HTTP upstream clients.
pub fn create_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    let pool = create_conn(&config.database_url).context("failed to create database pool")?;
    run_migrations(&pool)?;

    let upstream = &config.upstream;
    for (name, url) in [
        ("identity", &upstream.identity_url),
        ("file", &upstream.file_url),
        ("reader", &upstream.reader_url),
        ("push", &upstream.push_url),
    ] {
        if url.is_none() {
            warn!("{} service URL is not set, calls to it will fail", name);
        }
    }

    let identity = Arc::new(IdentityClient::new(UpstreamClient::new(
        "identity",
        upstream.identity_url.clone(),
        upstream.timeout,
    )?));
    let files = FileClient::new(UpstreamClient::new("file", upstream.file_url.clone(), upstream.timeout)?);
    let reader = ReaderClient::new(UpstreamClient::new("reader", upstream.reader_url.clone(), upstream.timeout)?);
    let push = PushClient::new(UpstreamClient::new("push", upstream.push_url.clone(), upstream.timeout)?);

    Ok(Backends {
        store: Arc::new(PgContentStore::new(pool)),
        cache: create_cache(config)?,
        graph: identity.clone(),
        communities: identity,
        attachments: Arc::new(files),
        news: Arc::new(reader),
        push: Arc::new(push),
    })
}

/// Wires the services together and starts the view flusher, the background
/// pool and the purge job. Must be called inside a Tokio runtime.
pub fn assemble(config: AppConfig, backends: Backends) -> Runtime {
    let shutdown = CancellationToken::new();
    let Backends {
        store,
        cache,
        graph,
        communities,
        attachments,
        news,
        push,
    } = backends;

    let resolver = Arc::new(SocialContextResolver::new(
        cache,
        store.clone(),
        graph,
        communities.clone(),
        config.social_context_ttl,
        config.upstream.timeout,
    ));

    let (background, workers) = BackgroundPool::start(config.background.workers, config.background.queue_capacity);
    let (views, flusher) = spawn_view_flusher(
        store.clone(),
        config.jobs.view_queue_capacity,
        config.jobs.view_flush_interval,
        shutdown.clone(),
    );

    let notifier = Arc::new(SubscriptionNotifier::new(store.clone(), resolver.clone(), push));
    let lifecycle = PostLifecycle::new(store.clone(), attachments, notifier, background.clone());
    let composer = Arc::new(PostComposer::new(store.clone(), Some(views.clone())));
    let feed = FeedAggregator::new(
        composer.clone(),
        store.clone(),
        news,
        config.feed.clone(),
        config.upstream.timeout,
    );

    let purge_store = store.clone();
    let retention = config.jobs.purge_retention;
    let purge = IntervalJob::new("purge-deleted-posts", config.jobs.purge_interval, move || {
        let store = purge_store.clone();
        async move {
            let purged = store.purge_deleted(Utc::now() - retention).await?;
            if purged > 0 {
                info!("Purged {} deleted posts", purged);
            }
            Ok(())
        }
    })
    .spawn(shutdown.clone());

    let state = Arc::new(AppState {
        config,
        store,
        resolver,
        communities,
        composer,
        feed,
        lifecycle,
        background,
        views,
    });

    Runtime {
        state,
        shutdown,
        tasks: vec![flusher, purge],
        workers,
    }
}

pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Runtime> {
    let backends = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || create_backends(&config)).await??
    };
    info!("Backends ready");
    Ok(assemble(config, backends))
}
