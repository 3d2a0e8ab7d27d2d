use anyhow::Context;
use relay_client::{BusClient, MqttBus};
use relay_worker::{
    AddOperands, Worker, WorkerConfig, init_logger, init_logger_with_file, print_banner,
    wait_for_shutdown_signal,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 加载 .env (可选)
    let _ = dotenv::dotenv();

    // 2. 加载配置 (缺失必填项时立即失败)
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_logger();
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e).context("Failed to load configuration");
        }
    };

    // 3. 日志
    init_logger_with_file(&config.log_level, config.log_dir.as_deref());
    print_banner();

    tracing::info!(
        endpoint = %config.endpoint,
        port = config.port,
        client_id = %config.client_id,
        "Connecting to {} with client ID '{}'...",
        config.endpoint,
        config.client_id
    );

    // 4. 运行直到收到信号或致命错误
    let worker = Worker::new(config.relay_options(), Arc::new(AddOperands));
    let bus_config = config.bus_config();
    let connect = async move {
        MqttBus::connect(bus_config)
            .await
            .map(|bus| Arc::new(bus) as Arc<dyn BusClient>)
    };

    worker
        .run(connect, wait_for_shutdown_signal())
        .await
        .context("Relay worker stopped with a fatal error")?;

    Ok(())
}
