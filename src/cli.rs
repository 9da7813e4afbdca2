use clap::Parser;

/// Polling orchestration engine for aviation data feeds
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Services to run (defaults to all)
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = ServiceName::all())]
    pub services: Vec<ServiceName>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable output for development
    Pretty,
    /// Structured output for production
    Json,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceName {
    /// HTTP API (health, admin, cycles)
    Web,
    /// Enqueues due sources
    Scheduler,
    /// Executes poll jobs
    Worker,
}

impl ServiceName {
    pub fn all() -> Vec<ServiceName> {
        vec![ServiceName::Web, ServiceName::Scheduler, ServiceName::Worker]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Web => "web",
            ServiceName::Scheduler => "scheduler",
            ServiceName::Worker => "worker",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_default_to_all() {
        let args = Args::parse_from(["skyfeed"]);
        assert_eq!(args.services, ServiceName::all());
    }

    #[test]
    fn services_accept_a_comma_list() {
        let args = Args::parse_from(["skyfeed", "--services", "web,worker", "--tracing", "json"]);
        assert_eq!(args.services, vec![ServiceName::Web, ServiceName::Worker]);
        assert_eq!(args.tracing, TracingFormat::Json);
    }
}
