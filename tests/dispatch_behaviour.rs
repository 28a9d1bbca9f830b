//! Behavioural scenarios for fleet dispatch.

mod dispatch;
