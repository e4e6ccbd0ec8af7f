// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Loop Control
//!
//! Shared lifecycle of the long-running consumers (rpc server, subscriber):
//! the `Idle -> Consuming -> Closed` state machine, the registered consumer
//! tag and the shutdown signal that stops the loop from `close`.

use crate::{
    envelope::Delivery,
    errors::AmqpError,
    transport::{ConsumeOptions, Transport},
};
use futures_util::StreamExt;
use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Closed,
}

pub(crate) struct ConsumeControl {
    state: Mutex<ConsumerState>,
    consumer_tag: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl ConsumeControl {
    pub(crate) fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        ConsumeControl {
            state: Mutex::new(ConsumerState::Idle),
            consumer_tag: Mutex::new(None),
            shutdown,
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *lock(&self.state)
    }

    /// Claims the loop. Only the first caller gets to consume.
    pub(crate) fn start(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        match *state {
            ConsumerState::Idle => {
                *state = ConsumerState::Consuming;
                Ok(())
            }
            ConsumerState::Consuming => Err(AmqpError::AlreadyConsuming),
            ConsumerState::Closed => Err(AmqpError::ChannelClosed),
        }
    }

    /// Moves to `Closed` and signals a running loop to stop.
    ///
    /// Returns the consumer tag to cancel, or `None` when already closed or when
    /// `channel_open` is false.
    pub(crate) fn shutdown(&self, channel_open: bool) -> Option<Option<String>> {
        {
            let mut state = lock(&self.state);
            let was_closed = *state == ConsumerState::Closed;
            *state = ConsumerState::Closed;
            if was_closed || !channel_open {
                return None;
            }
        }
        self.shutdown.send_replace(true);
        Some(lock(&self.consumer_tag).take())
    }

    /// Consumes `queue` and feeds every delivery to `on_delivery`, in order,
    /// until the consumer is cancelled or `shutdown` is called.
    pub(crate) async fn drive<F, Fut>(
        &self,
        transport: &dyn Transport,
        queue: &str,
        options: ConsumeOptions,
        mut on_delivery: F,
    ) -> Result<(), AmqpError>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Result<(), AmqpError>>,
    {
        let mut shutdown = self.shutdown.subscribe();

        let consumer = match transport.consume(queue, options).await {
            Ok(consumer) => consumer,
            Err(_) if *shutdown.borrow() => return Ok(()),
            Err(err) => {
                error!(queue = queue, error = err.to_string(), "failure to start consumer");
                return Err(err);
            }
        };
        *lock(&self.consumer_tag) = Some(consumer.tag.clone());

        // closed while the consumer was being registered
        if *shutdown.borrow_and_update() {
            if let Err(err) = transport.cancel(&consumer.tag).await {
                debug!(error = err.to_string(), "failure to cancel consumer");
            }
            return Ok(());
        }

        let mut deliveries = consumer.deliveries;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(err) = on_delivery(delivery).await {
                            error!(
                                queue = queue,
                                error = err.to_string(),
                                "error handling delivery"
                            );
                        }
                    }
                    Some(Err(err)) => {
                        warn!(queue = queue, error = err.to_string(), "errors consume msg")
                    }
                    None => {
                        debug!(queue = queue, "consumer stream ended");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
