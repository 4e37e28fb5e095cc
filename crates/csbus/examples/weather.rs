//! Minimal weather service — one server, one client, one router.
//!
//! Run with:
//!   cargo run --example weather

use std::time::Duration;

use serde::{Deserialize, Serialize};

use csbus::logging::{init_logging, LogFormat, LogLevel};
use csbus::message::{Address, OpID, Payload, ServiceID};
use csbus::routing::Router;
use csbus::service::{Client, Request, Server};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TodayWeather {
    city: String,
    forecast: String,
}

impl Payload for TodayWeather {
    fn operation_id() -> OpID {
        OpID::new("today-weather")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ComplianceLevel {
    percent: u8,
}

impl Payload for ComplianceLevel {
    fn operation_id() -> OpID {
        OpID::new("compliance-level")
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Text, LogLevel::Info);

    let router = Router::new();
    let service_id = ServiceID::new("weather");

    let server = Server::new(&router, Address::new("weather-server", 0))?;
    let provider = server.serve(service_id.clone())?;
    provider.register_request_handler(TodayWeather::operation_id(), |req: Request| {
        let mut query: TodayWeather = req.input()?;
        query.forecast = format!("sunny in {}", query.city);
        req.reply(&query)
    })?;
    provider.set_status(&ComplianceLevel { percent: 87 })?;
    provider.start_serving();

    let client = Client::new(
        &router,
        Address::new("weather-client", 0),
        Address::new("weather-server", 0),
    )?;
    let requester = client.requester(&service_id);

    requester.subscribe_status::<ComplianceLevel, _>(|level| {
        eprintln!("compliance level: {}%", level.percent);
    })?;

    let answer: TodayWeather = requester.call_sync(
        &TodayWeather {
            city: "Hanoi".into(),
            forecast: String::new(),
        },
        Duration::from_secs(3),
    )?;
    eprintln!("forecast: {}", answer.forecast);

    provider.set_status(&ComplianceLevel { percent: 92 })?;
    std::thread::sleep(Duration::from_millis(100));

    client.disconnect();
    server.shutdown();
    Ok(())
}
