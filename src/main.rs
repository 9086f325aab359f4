//! dotgate 主入口
//! 托管式加密货币收单网关

use std::sync::Arc;

use anyhow::Result;
use dotgate::{api, app_state::AppState, config::Config, infrastructure::db};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 启动对账窗口：超过该时长仍停留在非终态且带交易哈希的意图会被重读链上回执
const RECONCILE_WINDOW_SECS: i64 = 600;

#[tokio::main]
async fn main() -> Result<()> {
    // ✅ 1. 加载环境变量
    dotenvy::dotenv().ok();

    // ✅ 2. 初始化日志（结构化，env-filter 可调）
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dotgate=debug,tower_http=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("🚀 Starting dotgate payment gateway");

    // ✅ 3. 加载配置并连接数据库
    let config = Arc::new(Config::from_env()?);
    let pool = db::init_pool(&config.database).await?;
    tracing::info!("✅ Database connected");

    // ✅ 4. 运行数据库迁移（生产环境可单独执行，SKIP_MIGRATIONS=1 跳过）
    if std::env::var("SKIP_MIGRATIONS").is_err() {
        match sqlx::migrate!("./migrations").run(&pool).await {
            Ok(()) => tracing::info!("✅ Database migrations completed"),
            Err(e) => {
                tracing::warn!("⚠️ Database migrations failed (continuing): {}", e);
                tracing::info!("💡 Tip: Set SKIP_MIGRATIONS=1 to skip migrations on startup");
            }
        }
    } else {
        tracing::info!("⏭️ Database migrations skipped (SKIP_MIGRATIONS=1)");
    }

    // ✅ 5. 初始化应用状态（组合根）
    let state = Arc::new(AppState::new(pool, config.clone())?);

    // ✅ 6. 崩溃恢复：对账在途链上交易
    match state.engine.reconcile_inflight(RECONCILE_WINDOW_SECS).await {
        Ok(0) => {}
        Ok(count) => tracing::warn!(count = count, "Reconciled stale in-flight intents"),
        Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
    }

    // ✅ 7. 启动后台服务

    // 7.1 价格刷新
    tokio::spawn(state.price.clone().start_refresher());
    tracing::info!("✅ Price refresher started");

    // 7.2 链事件摄取（游标推进）
    tokio::spawn(state.ingestor.clone().run());
    tracing::info!("✅ Event ingestor started");

    // 7.3 周期任务：过期、自动释放、webhook 清扫、结算批处理
    state.scheduler.clone().spawn_all();
    tracing::info!("✅ Scheduler started");

    // ✅ 8. 启动 API 服务
    let app = api::routes(state.clone());
    let bind_addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!("🎉 Server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
