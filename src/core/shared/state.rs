use std::sync::Arc;

use crate::core::background::BackgroundPool;
use crate::core::config::AppConfig;
use crate::core::upstream::CommunityDirectory;
use crate::social::composer::PostComposer;
use crate::social::context::SocialContextResolver;
use crate::social::feed::FeedAggregator;
use crate::social::lifecycle::PostLifecycle;
use crate::social::store::ContentStore;
use crate::social::views::ViewRecorder;

/// Shared by every request handler.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ContentStore>,
    pub resolver: Arc<SocialContextResolver>,
    pub communities: Arc<dyn CommunityDirectory>,
    pub composer: Arc<PostComposer>,
    pub feed: FeedAggregator,
    pub lifecycle: PostLifecycle,
    pub background: BackgroundPool,
    pub views: ViewRecorder,
}
