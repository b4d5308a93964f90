//! CLI wrapper around the `sandbox` crate: maps command line flags onto a
//! `RuntimeConfig`, runs the sandbox, and prints the structured result as a
//! JSON object on standard output.
//!

#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate log;
extern crate nix;
extern crate sandbox;
extern crate serde_json;

use std::str::FromStr;

use error_chain::ChainedError;

use sandbox::{
    logger,
    FilterProfile,
    RuntimeConfig,
    RuntimeResult,
    Verdict,
    STDERR_SENTINEL,
    STDIN_SENTINEL,
    STDOUT_SENTINEL,
};


error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
    }

    errors {
        InvalidArgument(name: &'static str) {
            description("invalid argument value")
            display("invalid value for --{}", name)
        }
    }
}


/// The uid/gid the child is dropped to when running as root and no explicit
/// identity was requested (the conventional `nobody` ids).
const NOBODY: u32 = 65534;

fn get_arg_matches() -> clap::ArgMatches<'static> {
    clap::App::new("sandbox-bin")
        .version("0.1.0")
        .about("Sandbox for online judge workloads: runs one untrusted \
                program under resource ceilings and prints a JSON verdict.")
        .after_help("Notice: multi-valued parameters are space separated and \
                     must be quoted as one shell word, e.g. --exec_args \"-l 1\"")
        .arg(clap::Arg::with_name("max_cpu_time")
            .short("t")
            .long("max_cpu_time")
            .takes_value(true)
            .value_name("MS")
            .default_value("-1")
            .help("set cpu time limit in milliseconds, -1 for no limit"))
        .arg(clap::Arg::with_name("max_stack")
            .short("s")
            .long("max_stack")
            .takes_value(true)
            .value_name("KIB")
            .default_value("-1")
            .help("set process stack limit in KiB, -1 for no limit"))
        .arg(clap::Arg::with_name("max_memory")
            .short("m")
            .long("max_memory")
            .takes_value(true)
            .value_name("KIB")
            .default_value("-1")
            .help("set memory limit in KiB, -1 for no limit"))
        .arg(clap::Arg::with_name("max_output_size")
            .short("q")
            .long("max_output_size")
            .takes_value(true)
            .value_name("BYTES")
            .default_value("-1")
            .help("set output limit in bytes, -1 for no limit"))
        .arg(clap::Arg::with_name("max_open_file_number")
            .short("f")
            .long("max_open_file_number")
            .takes_value(true)
            .value_name("COUNT")
            .default_value("-1")
            .help("set open file number limit, -1 for no limit"))
        .arg(clap::Arg::with_name("max_thread")
            .long("max_thread")
            .takes_value(true)
            .value_name("COUNT")
            .default_value("-1")
            .help("set thread number limit, -1 for the default of 8"))
        .arg(clap::Arg::with_name("exec_path")
            .short("c")
            .long("exec_path")
            .takes_value(true)
            .value_name("PATH")
            .required(true)
            .help("set executable file path"))
        .arg(clap::Arg::with_name("exec_args")
            .short("a")
            .long("exec_args")
            .takes_value(true)
            .value_name("ARGS")
            .help("set space-separated exec arguments, quoted as one word"))
        .arg(clap::Arg::with_name("exec_env")
            .short("n")
            .long("exec_env")
            .takes_value(true)
            .value_name("ENV")
            .help("set space-separated KEY=VALUE environment, quoted as one word"))
        .arg(clap::Arg::with_name("input_path")
            .short("i")
            .long("input_path")
            .takes_value(true)
            .value_name("PATH")
            .default_value(STDIN_SENTINEL)
            .help("set input redirect"))
        .arg(clap::Arg::with_name("output_path")
            .short("o")
            .long("output_path")
            .takes_value(true)
            .value_name("PATH")
            .default_value(STDOUT_SENTINEL)
            .help("set output redirect"))
        .arg(clap::Arg::with_name("error_path")
            .short("e")
            .long("error_path")
            .takes_value(true)
            .value_name("PATH")
            .default_value(STDERR_SENTINEL)
            .help("set error output redirect"))
        .arg(clap::Arg::with_name("uid")
            .short("u")
            .long("uid")
            .takes_value(true)
            .value_name("UID")
            .default_value("-1")
            .help("set running user id, -1 to keep the current one"))
        .arg(clap::Arg::with_name("gid")
            .short("g")
            .long("gid")
            .takes_value(true)
            .value_name("GID")
            .default_value("-1")
            .help("set running group id, -1 to keep the current one"))
        .arg(clap::Arg::with_name("no_change_child_id")
            .long("no_change_child_id")
            .help("do not drop to the nobody uid/gid when running as root"))
        .arg(clap::Arg::with_name("scmp_name")
            .short("p")
            .long("scmp_name")
            .takes_value(true)
            .value_name("PROFILE")
            .possible_values(&["", "compile", "gentle", "strict", "low", "mid", "high"])
            .default_value("")
            .help("set seccomp rule name"))
        .arg(clap::Arg::with_name("use_rlimit_to_limit_memory")
            .long("use_rlimit_to_limit_memory")
            .help("enforce the memory limit through the kernel address space \
                   limit instead of polling resident memory"))
        .arg(clap::Arg::with_name("log_path")
            .short("l")
            .long("log_path")
            .takes_value(true)
            .value_name("PATH")
            .default_value("")
            .help("set runtime log path, empty or `stderr` for standard error"))
        .arg(clap::Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .help("record log in verbose"))
        .get_matches()
}

/// Parse a numeric limit flag; `-1` maps to "unset".
fn get_limit(matches: &clap::ArgMatches<'_>, name: &'static str)
    -> Result<Option<i64>> {
    let raw = matches.value_of(name).unwrap_or("-1");
    let value = i64::from_str(raw)
        .chain_err(|| ErrorKind::InvalidArgument(name))?;
    if value == -1 {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// Parse a uid/gid flag; `-1` maps to "unset", anything else must be a
/// non-negative id.
fn get_id(matches: &clap::ArgMatches<'_>, name: &'static str)
    -> Result<Option<u32>> {
    let raw = matches.value_of(name).unwrap_or("-1");
    let value = i64::from_str(raw)
        .chain_err(|| ErrorKind::InvalidArgument(name))?;
    match value {
        -1 => Ok(None),
        id if id >= 0 && id <= i64::from(u32::max_value()) => Ok(Some(id as u32)),
        _ => Err(ErrorKind::InvalidArgument(name).into()),
    }
}

fn build_config(matches: &clap::ArgMatches<'_>) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::new(
        matches.value_of("exec_path").unwrap_or_default());

    config.max_cpu_time = get_limit(matches, "max_cpu_time")?;
    config.max_stack = get_limit(matches, "max_stack")?;
    config.max_memory = get_limit(matches, "max_memory")?;
    config.max_output_size = get_limit(matches, "max_output_size")?;
    config.max_open_file_number = get_limit(matches, "max_open_file_number")?;
    config.max_thread = get_limit(matches, "max_thread")?;

    config.exec_args = matches.value_of("exec_args").unwrap_or("").to_owned();
    config.exec_env = matches.value_of("exec_env").unwrap_or("").to_owned();

    config.input_path = matches.value_of("input_path")
        .unwrap_or(STDIN_SENTINEL).to_owned();
    config.output_path = matches.value_of("output_path")
        .unwrap_or(STDOUT_SENTINEL).to_owned();
    config.error_path = matches.value_of("error_path")
        .unwrap_or(STDERR_SENTINEL).to_owned();

    config.uid = get_id(matches, "uid")?;
    config.gid = get_id(matches, "gid")?;

    // Running as root without an explicit identity drops the child to
    // nobody, unless the caller opted out.
    if nix::unistd::geteuid().is_root()
        && !matches.is_present("no_change_child_id") {
        if config.uid.is_none() {
            config.uid = Some(NOBODY);
        }
        if config.gid.is_none() {
            config.gid = Some(NOBODY);
        }
    }

    config.scmp_name = match matches.value_of("scmp_name").unwrap_or("") {
        "" => None,
        name => Some(FilterProfile::from_str(name)
            .chain_err(|| ErrorKind::InvalidArgument("scmp_name"))?),
    };

    config.use_rlimit_to_limit_memory =
        matches.is_present("use_rlimit_to_limit_memory");

    Ok(config)
}

/// Print the result record as a JSON object on standard output.
fn print_result(result: &RuntimeResult) {
    match serde_json::to_string_pretty(result) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("cannot serialize result: {}", e);
            eprintln!("cannot serialize result: {}", e);
        },
    };
}

/// A result record for runs the sandbox could not carry out at all.
fn system_error_result() -> RuntimeResult {
    RuntimeResult {
        result: Verdict::SystemError,
        ..RuntimeResult::default()
    }
}

fn real_main() -> i32 {
    let matches = get_arg_matches();

    let log_path = matches.value_of("log_path").unwrap_or("").to_owned();
    let verbose = matches.is_present("verbose");
    if let Err(e) = logger::init(&log_path, verbose) {
        eprintln!("cannot initialize log sink: {}", e);
    }

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid invocation: {}", e.display_chain());
            print_result(&system_error_result());
            return 1;
        },
    };

    match sandbox::run(&config) {
        Ok(result) => {
            print_result(&result);
            0
        },
        Err(e) => {
            log::error!("sandbox failed: {}", e.display_chain());
            print_result(&system_error_result());
            1
        },
    }
}

fn main() {
    std::process::exit(real_main());
}


#[cfg(test)]
mod tests {
    use super::system_error_result;
    use sandbox::Verdict;

    #[test]
    fn test_system_error_result_shape() {
        let result = system_error_result();

        assert_eq!(Verdict::SystemError, result.result);
        assert_eq!(0, result.exit_code);
        assert_eq!(0, result.signal);
    }
}
