use crate::config::MqttConfig;
use crate::error::AppError;
use std::time::Duration;
use uuid::Uuid;

use rumqttc::v5 as mqtt5;
use rumqttc::Transport;

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type Publish = mqtt5::mqttbytes::v5::Publish;
pub type QoS = mqtt5::mqttbytes::QoS;

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = format!("energy-aggregator-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_start(cfg.clean_session);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(build_options(cfg), 50)
}

/// QoS 1 unless 0 or 2 is asked for; redelivery is safe because energy
/// rows are upserted.
pub fn qos(v: u8) -> QoS {
    match v {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub async fn next_publish(eventloop: &mut EventLoop) -> Result<Publish, AppError> {
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => return Ok(p),
            Ok(_) => continue,
            Err(e) => return Err(AppError::Mqtt(e.to_string())),
        }
    }
}
