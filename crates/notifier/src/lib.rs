//! Delivery workers: consume scheduled notifications from RabbitMQ, deliver
//! them through the registered senders and escalate failures to the retry
//! queues.

pub mod amqp;
pub mod delivery;
pub mod dispatch;
pub mod email;
pub mod retry;
pub mod sender;
pub mod telegram;
pub mod worker;
