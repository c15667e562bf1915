use tracing_subscriber::EnvFilter;

pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = if level.eq_ignore_ascii_case("trace") {
            "trace".to_string()
        } else {
            format!("{level},reqwest=warn,hyper=warn,hyper_util=warn")
        };
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
