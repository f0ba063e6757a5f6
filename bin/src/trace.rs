//! tracing configuration
use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Installed subscriber settings
#[derive(Debug)]
pub struct Config {
    /// formatting applied to logs
    pub log_frmt: String,
}

impl Config {
    /// Install the global subscriber, writing to stderr so stdout carries
    /// only message output. `log` is an `EnvFilter` directive, falling back
    /// to `info` if it doesn't parse.
    pub fn init(log: &str, log_frmt: &str) -> Result<Self> {
        let filter = EnvFilter::try_new(log).or_else(|_| EnvFilter::try_new("info"))?;

        match log_frmt {
            "json" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            "pretty" => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new())
                            .with_writer(std::io::stderr),
                    )
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
        }

        Ok(Self {
            log_frmt: log_frmt.to_owned(),
        })
    }
}
