// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::{Args, Parser, Subcommand};
use rabbitmq_patterns::{
    configs::AmqpConfigs,
    envelope::{now_millis, MessageMetadata},
    errors::{AmqpError, HandlerError},
    events::{internal, EventListener},
    handler::{RpcHandler, SubscriberHandler},
    publisher::{Publisher, PublisherOptions},
    rpc_client::{RpcClient, RpcClientOptions},
    rpc_server::{RpcServer, RpcServerOptions},
    serializer::Message,
    subscriber::{Subscriber, SubscriberOptions},
    transport::amqp::AmqpConnection,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amqp-cli")]
#[command(about = "AMQP rpc, pub/sub and broker event tools")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

/// Overrides for the `AMQP_*` environment configuration.
#[derive(Args)]
struct BrokerArgs {
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    vhost: Option<String>,
    #[arg(long, global = true)]
    user: Option<String>,
    #[arg(long, global = true)]
    password: Option<String>,
}

impl BrokerArgs {
    fn configs(self) -> Result<AmqpConfigs, AmqpError> {
        let mut cfg = AmqpConfigs::from_env()?;
        if let Some(host) = self.host {
            cfg.host = host;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(vhost) = self.vhost {
            cfg.vhost = vhost;
        }
        if let Some(user) = self.user {
            cfg.user = user;
        }
        if let Some(password) = self.password {
            cfg.password = password;
        }
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the multiplication rpc: `{"a": x, "b": y}` -> `x * y`
    RpcServer {
        #[arg(long, default_value = "rpc.mult")]
        name: String,
        /// Share the queue with servers already consuming it
        #[arg(long)]
        shared: bool,
    },
    /// Call an rpc once and print the response
    RpcCall {
        #[arg(long, default_value = "rpc.mult")]
        name: String,
        /// JSON request body
        #[arg(long, default_value = r#"{"a": 4, "b": 13}"#)]
        payload: String,
        /// Timeout in seconds
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
    },
    /// Publish a JSON payload to a topic
    Publish {
        topic: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Publishing frequency, 0 publishes once
        #[arg(long, default_value_t = 0.0)]
        hz: f64,
    },
    /// Print messages received on a topic
    Subscribe { topic: String },
    /// Print broker internal events
    Events {
        #[arg(default_values_t = [
            internal::QUEUE_CREATED.to_owned(),
            internal::CONSUMER_CREATED.to_owned(),
        ])]
        events: Vec<String>,
    },
}

fn mult(msg: Message, _meta: MessageMetadata) -> Result<Message, HandlerError> {
    let body = msg.as_json().ok_or("expected a json body")?;
    let a = body["a"].as_f64().ok_or("missing number `a`")?;
    let b = body["b"].as_f64().ok_or("missing number `b`")?;
    Ok(Message::Json(json!(a * b)))
}

fn print_message(msg: Message, meta: MessageMetadata) -> Result<(), HandlerError> {
    let latency = meta
        .latency_ms(now_millis())
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "n/a".to_owned());
    println!("[{}] {:?} (latency {})", meta.routing_key, msg, latency);
    Ok(())
}

fn parse_json(raw: &str) -> Result<Message, Box<dyn std::error::Error>> {
    let value: Value = serde_json::from_str(raw)?;
    Ok(Message::Json(value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = cli.broker.configs()?;
    let conn = Arc::new(AmqpConnection::connect(&cfg).await?);

    match cli.command {
        Command::RpcServer { name, shared } => {
            let handler: Arc<dyn RpcHandler> = Arc::new(mult);
            let server = Arc::new(
                RpcServer::new(
                    Arc::new(conn.open_channel().await?),
                    RpcServerOptions::new(&name).strict(!shared),
                    Some(handler),
                )
                .await?,
            );
            let task = server.run_threaded()?;
            tokio::signal::ctrl_c().await?;
            server.close().await?;
            task.await??;
        }
        Command::RpcCall {
            name,
            payload,
            timeout,
        } => {
            let client =
                RpcClient::new(Arc::new(conn.open_channel().await?), RpcClientOptions::new(&name))
                    .await?;
            let response = client
                .call(&parse_json(&payload)?, Duration::from_secs_f64(timeout))
                .await?;
            println!("{response:?}");
            info!(delay_ms = client.delay().as_millis() as u64, "rpc call done");
            client.close().await?;
        }
        Command::Publish { topic, payload, hz } => {
            let publisher = Publisher::new(
                Arc::new(conn.open_channel().await?),
                PublisherOptions::new(&topic),
            )
            .await?;
            let msg = parse_json(&payload)?;
            tokio::select! {
                result = publisher.publish_loop(&msg, hz) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
            info!(sent = publisher.sent(), "publisher done");
            publisher.close().await?;
        }
        Command::Subscribe { topic } => {
            let handler: Arc<dyn SubscriberHandler> = Arc::new(print_message);
            let subscriber = Arc::new(
                Subscriber::new(
                    Arc::new(conn.open_channel().await?),
                    SubscriberOptions::new(&topic),
                    handler,
                )
                .await?,
            );
            let task = subscriber.run_threaded()?;

            let mut report = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = report.tick() => {
                        info!(topic = topic, hz = subscriber.rate(), "incoming rate")
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            subscriber.close().await?;
            task.await??;
        }
        Command::Events { events } => {
            let listener = EventListener::new(conn.clone());
            for event in &events {
                let handler: Arc<dyn SubscriberHandler> = Arc::new(print_message);
                listener.listen(event, handler).await?;
            }
            tokio::signal::ctrl_c().await?;
            listener.stop_all().await?;
        }
    }

    conn.close().await?;
    Ok(())
}
