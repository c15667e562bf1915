use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use super::data_io::DataFormat;
use super::store::DEFAULT_STATE_FILE;
use super::webdriver::Browser;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "propscrape",
    version,
    about = "Resumable batch scraper for real-estate listings, driven over WebDriver"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    Scrape(ScrapeArgs),
    Export {
        #[arg(long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = DataFormat::Csv)]
        format: DataFormat,
    },
    Status {
        #[arg(long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Reset {
        #[arg(long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },
}

#[derive(Debug, clap::Args, Clone)]
pub struct ScrapeArgs {
    #[arg(value_name = "URL")]
    pub url: String,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub start_page: u32,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub end_page: u32,

    #[arg(long, value_name = "MS", default_value_t = 3000)]
    pub delay_ms: u64,

    #[arg(long, default_value_t = false)]
    pub resume: bool,

    #[arg(long, value_name = "N", default_value_t = 60)]
    pub batch_size: usize,

    #[arg(long, value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
    pub state_file: PathBuf,

    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = DataFormat::Csv)]
    pub format: DataFormat,

    #[arg(long, default_value_t = false)]
    pub no_export: bool,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    #[arg(long, value_enum, default_value_t = Browser::Chrome)]
    pub browser: Browser,

    #[arg(long, default_value_t = false)]
    pub headless: bool,

    #[arg(long, value_name = "FILE")]
    pub extractor_script: Option<PathBuf>,

    #[arg(long, value_name = "DOMAIN")]
    pub domain: Option<String>,

    #[arg(long, value_name = "SECS", default_value_t = 600)]
    pub stall_threshold_secs: u64,

    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub watchdog_interval_secs: u64,

    #[arg(long, value_enum, default_value_t = MitigationArg::PerBatchAndRetry)]
    pub mitigation: MitigationArg,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum MitigationArg {
    PerBatchAndRetry,
    PerRetryOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_defaults() {
        let cli = Cli::parse_from([
            "propscrape",
            "scrape",
            "https://www.realestate.com.au/buy/in-bondi/list-1",
            "--end-page",
            "4",
        ]);
        let Command::Scrape(args) = cli.command else {
            panic!("expected scrape");
        };
        assert_eq!(args.start_page, 1);
        assert_eq!(args.end_page, 4);
        assert_eq!(args.batch_size, 60);
        assert_eq!(args.state_file, PathBuf::from("scrape_state.json"));
        assert_eq!(args.browser, Browser::Chrome);
        assert_eq!(args.mitigation, MitigationArg::PerBatchAndRetry);
        assert!(!args.resume && !args.no_export);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn global_log_level_after_subcommand() {
        let cli = Cli::parse_from(["propscrape", "status", "--json", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Command::Status { json: true, .. }));
    }

    #[test]
    fn mitigation_and_format_values() {
        let cli = Cli::parse_from([
            "propscrape",
            "scrape",
            "https://example.com/buy/list-1",
            "--mitigation",
            "per-retry-only",
            "--format",
            "json",
            "--browser",
            "firefox",
        ]);
        let Command::Scrape(args) = cli.command else {
            panic!("expected scrape");
        };
        assert_eq!(args.mitigation, MitigationArg::PerRetryOnly);
        assert_eq!(args.format, DataFormat::Json);
        assert_eq!(args.browser, Browser::Firefox);
    }
}
