//! Behavioural scenarios for test and live failovers.

mod failover;
