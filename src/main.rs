use std::{
    process,
    sync::{Arc, OnceLock, Weak},
};

use tidewatch::{config::Config, logger::LoggerManager, print_error};
use tidewatch_mqtt::{
    AckData, ClientError, Message, MqttCore, QoS, RequestId, RumqttEngine, SharedAckCallback,
};
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn build_core(cfg: &Config) -> Result<Arc<MqttCore>, ClientError> {
    let engine = Arc::new(RumqttEngine::from_config(&cfg.transport)?);
    Ok(Arc::new(MqttCore::from_config(engine, &cfg.transport)?))
}

/// Announces the session on the status topic every time it comes up.
fn install_hooks(core: &Arc<MqttCore>, status_topic: Option<String>) {
    let weak: Weak<MqttCore> = Arc::downgrade(core);
    core.on_online(move || {
        info!("MQTT session online");
        let (Some(core), Some(topic)) = (weak.upgrade(), status_topic.as_deref()) else {
            return;
        };
        if let Err(e) = core.publish_async(topic, "online", QoS::AtLeastOnce, true, None) {
            warn!("Failed to publish status to {}: {}", topic, e);
        }
    });
    core.on_offline(|| warn!("MQTT session offline, requests are queued until it returns"));
    core.on_unhandled_message(|message: &Message| {
        debug!("Message on unexpected topic {}", message.topic);
    });
}

fn subscribe_configured(core: &MqttCore, cfg: &Config) {
    for subscription in &cfg.daemon.subscriptions {
        let topic = subscription.topic.clone();
        let on_ack: SharedAckCallback = Arc::new(move |id: RequestId, ack: AckData| {
            info!("Subscription to {} ({}) answered: {:?}", topic, id, ack);
        });
        let result = core.subscribe_async(
            &subscription.topic,
            subscription.qos,
            Arc::new(|message: &Message| match message.payload_str() {
                Some(text) => info!("{}: {}", message.topic, text),
                None => info!("{}: {} bytes", message.topic, message.payload.len()),
            }),
            Some(on_ack),
        );
        match result {
            Ok(RequestId::Queued) => debug!("Subscription to {} queued", subscription.topic),
            Ok(id) => debug!("Subscribing to {} as {}", subscription.topic, id),
            Err(e) => error!("Failed to subscribe to {}: {}", subscription.topic, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting tidewatch version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.transport);

    let core = build_core(cfg).unwrap_or_else(|e| {
        error!("Failed to create MQTT session: {}", e);
        process::exit(1);
    });
    install_hooks(&core, cfg.daemon.status_topic.clone());

    let connecting = Arc::clone(&core);
    match tokio::task::spawn_blocking(move || connecting.connect()).await? {
        Ok(0) => info!(
            "Connected to {}:{}",
            cfg.transport.endpoint.host, cfg.transport.endpoint.port
        ),
        Ok(code) => {
            error!("Broker refused the connection (code {})", code);
            process::exit(1);
        }
        Err(e) if e.is_timeout() => warn!("{}, still trying in the background", e),
        Err(e) => {
            error!("Failed to connect: {}", e);
            process::exit(1);
        }
    }

    subscribe_configured(&core, cfg);

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown...");

    let disconnecting = Arc::clone(&core);
    match tokio::task::spawn_blocking(move || disconnecting.disconnect()).await? {
        Ok(_) => debug!("Disconnected from broker"),
        Err(e) => warn!("Disconnect did not complete cleanly: {}", e),
    }
    drop(core);

    info!("Shutdown complete");
    Ok(())
}
