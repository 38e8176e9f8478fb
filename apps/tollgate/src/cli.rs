use clap::Parser;

use tollgate_common::GlobalConfigPatch;

/// Multi-tenant LLM API gateway.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version)]
pub struct Cli {
    /// Bind address.
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Database DSN (sqlite:// or postgres://).
    #[arg(long)]
    pub dsn: Option<String>,

    /// Retries per relayed request on top of the initial attempt.
    #[arg(long)]
    pub retry_times: Option<u32>,

    /// Persist recordable relay errors to the error-log sink.
    #[arg(long)]
    pub error_log_enabled: Option<bool>,

    /// Redirect target for unknown routes.
    #[arg(long)]
    pub frontend_base_url: Option<String>,

    /// Outbound proxy for upstream egress.
    #[arg(long)]
    pub proxy: Option<String>,
}

impl Cli {
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            retry_times: self.retry_times,
            error_log_enabled: self.error_log_enabled,
            frontend_base_url: self.frontend_base_url,
            session_secret: None,
            proxy: self.proxy,
            sensitive_words: None,
            cache_refresh_secs: None,
        }
    }
}
