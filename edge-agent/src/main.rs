use edge_agent::{AgentState, BackgroundTasks, print_banner, setup_environment};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 设置环境 (dotenv, 配置, 日志)
    let config = setup_environment();

    print_banner();
    tracing::info!(
        version = %config.agent_version,
        work_dir = %config.work_dir.display(),
        "OIBus edge agent starting..."
    );

    // 2. 初始化状态 (账本, 密钥, 配置存储, 引擎)
    let mut tasks = BackgroundTasks::new();
    let state = AgentState::initialize(&config, &tasks).await?;

    // 3. 启动对账
    state.reconcile().await?;
    if let Err(e) = state.bootstrap_registration().await {
        tracing::error!("Registration bootstrap failed: {e}");
    }

    // 4. 启动后台任务
    state.start_background_tasks(&mut tasks)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    // 5. 先停消息引擎，再停其余任务
    state.shutdown().await;
    let abandoned = tasks.shutdown(config.shutdown_timeout()).await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "Some background tasks did not stop in time");
    }

    tracing::info!("OIBus edge agent stopped");
    Ok(())
}
