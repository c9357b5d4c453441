use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(name = "auspexd")]
#[clap(about = "Auspex process telemetry daemon", version = crate::version())]
pub struct AuspexdOpts {
    /// Configuration file to use instead of the default one.
    #[clap(long)]
    pub config_file: Option<String>,

    /// Increase logging verbosity. Repeat for more.
    #[clap(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub fn log_level_from_verbosity(count: u8) -> log::Level {
    match count {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}
