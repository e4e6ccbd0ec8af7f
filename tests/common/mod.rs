// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_patterns::transport::Transport;
use std::time::Duration;

/// Waits until `queue` has at least one consumer registered.
pub async fn wait_for_consumer(transport: &dyn Transport, queue: &str) {
    for _ in 0..200 {
        if let Ok(Some(info)) = transport.queue_info(queue).await {
            if info.consumer_count > 0 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no consumer registered on {queue}");
}
