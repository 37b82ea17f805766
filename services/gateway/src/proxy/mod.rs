//! Connection handling.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Service -> [PROXY header] -> Router -> Sniffers -> Rules -> Outbound -> Upstream
//!                   \-> legacy Minecraft outbound (services with `minecraft` options)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let router = Arc::new(Router::new(Arc::new(SystemDialer::default()), pool));
//! router.apply(&RouterOptions::from(&root))?;
//! let service = Service::start(root.services[0].clone(), router).await?;
//! ```

pub mod listener;
pub mod outbound;
pub mod router;
pub mod rules;
pub mod sniff;

pub use listener::{PreparedService, Service};
pub use outbound::{Dialer, MinecraftOutbound, Outbound, PlainOutbound, SystemDialer};
pub use router::{Router, RouterOptions, RouterSnapshot};
pub use rules::{CustomRule, CustomRuleFactory, CustomRuleRegistry, Rule};
pub use sniff::{ClientConn, Sniffer, SnifferRegistry};
