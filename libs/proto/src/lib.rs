//! Wire types for the fleet agent control channel.
//!
//! Generated by `build.rs` from `proto/fleet/control/v1/control.proto` into
//! `src/gen`, which is checked in.

pub mod control {
    pub mod v1 {
        include!("gen/fleet.control.v1.rs");

        pub use agent_control_client::AgentControlClient;
    }
}
