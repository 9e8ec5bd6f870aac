use clap::Parser;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "throttle-gateway")]
#[command(about = "Rate limiting HTTP gateway with per-request latency metrics")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // How many requests a client can make in a single frame
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub requests_per_frame: u32,

    // Duration of a frame in seconds
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub frame_duration: u64,

    // Path serving the metrics report, always exempt from rate limiting
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,

    // Extra paths exempt from rate limiting (repeatable)
    #[arg(long = "bypass-route")]
    pub bypass_routes: Vec<String>,
}

impl Args {
    // Checks the bits clap's value parsers can't express. Runs before the
    // server binds, so a bad value is fatal at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.metrics_path.starts_with('/') {
            anyhow::bail!("metrics path must start with '/': {:?}", self.metrics_path);
        }
        for route in &self.bypass_routes {
            if !route.starts_with('/') {
                anyhow::bail!("bypass route must start with '/': {:?}", route);
            }
        }
        Ok(())
    }

    // Bypass set actually used by admission control: the configured routes
    // plus the metrics path, so scraping is never itself rate limited.
    pub fn effective_bypass_routes(&self) -> Vec<String> {
        let mut routes = self.bypass_routes.clone();
        if !routes.contains(&self.metrics_path) {
            routes.push(self.metrics_path.clone());
        }
        routes
    }
}
