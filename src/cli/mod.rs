pub mod commands;

use clap::{Arg, ArgAction, Command};

pub const DEFAULT_CONFIG_FILE: &str = "furnace_cal.toml";

/// Overrides accepted by every command that loads a session configuration.
fn override_args() -> Vec<Arg> {
    vec![
        Arg::new("thermometer-port")
            .long("thermometer-port")
            .value_name("PORT")
            .help("Serial port of the reference thermometer"),
        Arg::new("furnace-port")
            .long("furnace-port")
            .value_name("PORT")
            .help("Serial port of the furnace controller"),
        Arg::new("points")
            .long("points")
            .value_name("LIST")
            .help("Comma separated setpoints in °C, e.g. 50,100,150"),
        Arg::new("repetitions")
            .short('r')
            .long("repetitions")
            .value_name("N")
            .help("Readings per channel at every point"),
        Arg::new("operator")
            .long("operator")
            .value_name("NAME")
            .help("Operator recorded in the session"),
        Arg::new("simulate")
            .long("simulate")
            .action(ArgAction::SetTrue)
            .help("Use the built-in furnace and thermometer simulators"),
    ]
}

pub fn build_cli() -> Command {
    Command::new("furnace_cal")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Automated temperature sensor calibration against a furnace and reference thermometer")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Session configuration (TOML)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Run a calibration session")
                .args(override_args())
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .value_parser(["console", "json", "csv"])
                        .default_value("console")
                        .help("Report format"),
                )
                .arg(
                    Arg::new("output-file")
                        .short('o')
                        .long("output-file")
                        .value_name("FILE")
                        .help("Also write the report to FILE"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Validate the configuration and print the session plan")
                .args(override_args()),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing file"),
                ),
        )
        .subcommand(
            Command::new("scan-ports")
                .about("Probe serial ports for a thermometer or furnace")
                .arg(
                    Arg::new("baud")
                        .short('b')
                        .long("baud")
                        .value_name("RATE")
                        .default_value("9600"),
                )
                .arg(
                    Arg::new("slave")
                        .long("slave")
                        .value_name("ID")
                        .default_value("1")
                        .help("Modbus slave id of the furnace"),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_run_overrides_parse() {
        let matches = build_cli()
            .try_get_matches_from(["furnace_cal", "run", "--simulate", "--points", "50,100", "-f", "json"])
            .unwrap();
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert!(run.get_flag("simulate"));
        assert_eq!(run.get_one::<String>("format").map(String::as_str), Some("json"));
    }
}
