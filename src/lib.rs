pub mod address;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod export;
pub mod filters;
pub mod geocoding;
pub mod providers;
pub mod reconcile;
pub mod report;
pub mod summary;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::AddressRecord;
pub use crate::config::{AppConfig, ProviderKind};
pub use crate::dataset::Dataset;
pub use crate::errors::{AppError, AppResult};
pub use crate::filters::{FilterSelection, FilteredView};
pub use crate::geocoding::{
    Coordinates, GeocodeCache, GeocodeProvider, GeocodeResult, GeocodeStatus, GeocodingResolver,
    ProviderOutcome,
};
pub use crate::providers::{build_provider, GoogleGeocoder, NominatimGeocoder};
pub use crate::reconcile::{GeocodeRun, GeocodeSession};

pub fn init_tracing(verbosity: u8) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let fallback = match verbosity {
            0 => "info,registry_report=debug",
            1 => "debug",
            _ => "trace",
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
