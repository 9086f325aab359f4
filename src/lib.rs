//! dotgate - 托管式加密货币收单网关核心
//!
//! 支付意图生命周期引擎：法币计价 + 链上托管 + Webhook 通知

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod metrics;
pub mod repository;
pub mod service;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode};

pub mod prelude {
    pub use crate::{
        app_state::AppState,
        domain::{IntentStatus, PaymentIntent},
        error::{AppError, AppErrorCode},
    };
}
