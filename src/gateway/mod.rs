pub mod auth;
pub mod openai;

use crate::config::Config;
use crate::perplexity;
use crate::registry::ModelRegistry;

/// API 网关共享状态：启动时构建一次，只读，经 Arc 传入各处理器。
pub struct GatewayState {
    pub cfg: Config,
    pub registry: ModelRegistry,
    pub perplexity: perplexity::Client,
}
