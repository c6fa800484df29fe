//! Active/standby election for the message router.
//!
//! One Redis key is the lock: its value is the holder's instance id and
//! its TTL bounds how stale a dead PRIMARY can be. A single periodic
//! task renews the lock when PRIMARY and tries to acquire it when
//! STANDBY. Only the PRIMARY instance processes messages.
//!
//! ```no_run
//! use relay_standby::{Election, ElectionConfig, Role};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let config = ElectionConfig::new("redis://localhost:6379".to_string())
//!         .with_lock_key("relay:router:primary".to_string());
//!
//!     let election = Arc::new(Election::new(config).await.unwrap());
//!     election.clone().start().await.unwrap();
//!
//!     let mut role = election.subscribe();
//!     if *role.borrow() == Role::Primary {
//!         // process messages
//!     }
//!     let _ = role.changed().await;
//! }
//! ```

mod election;
mod error;

pub use election::{Election, ElectionConfig, LockState, Role, REFRESH_INTERVAL};
pub use error::{Result, StandbyError};
