// genopt/src/cli.rs

/// Structure representing command-line arguments.
#[derive(Debug)]
pub struct Args {
    pub config: std::path::PathBuf,
    pub output: Option<std::path::PathBuf>,
}

impl Args {
    /// Parses command-line arguments using `clap`.
    ///
    /// # Returns
    /// * `Args` - Struct containing parsed arguments.
    pub fn parse() -> Self {
        let matches = command().get_matches();
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Args {
            config: matches
                .get_one::<std::path::PathBuf>("config")
                .cloned()
                .unwrap_or_default(),
            output: matches.get_one::<std::path::PathBuf>("output").cloned(),
        }
    }
}

fn command() -> clap::Command {
    clap::Command::new("genopt")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Genetic optimizer for trading strategy parameters")
        .arg(
            clap::Arg::new("config")
            .short('c')
            .long("config")
            .help("Path to the settings.json configuration file")
            .required(true)
            .num_args(1)
            .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            clap::Arg::new("output")
            .short('o')
            .long("output")
            .help("Write the optimization report as JSON to this file instead of stdout")
            .num_args(1)
            .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
}
