// src/lib.rs
pub mod ports {
    pub mod paper_venue;
    pub mod venue;
}
pub mod trade {
    pub mod execution {
        pub mod gateway_box;
    }
    pub mod hedge_pair;
    pub mod reconcile;
    pub mod trigger;
}
pub mod alert;
pub mod config;
pub mod email_client;
pub mod grid;
pub mod gridhedge;
pub mod order_index;
pub mod persist;
pub mod rate_limit_notifier;
pub mod snapshot;
pub mod stats;
pub mod status;
