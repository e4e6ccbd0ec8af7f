// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod configs;
pub mod correlation;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod rate;
pub mod rpc_client;
pub mod rpc_server;
pub mod serializer;
pub mod subscriber;
pub mod topology;
pub mod transport;

pub use consumer::ConsumerState;
