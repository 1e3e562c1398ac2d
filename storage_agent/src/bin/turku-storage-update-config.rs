extern crate clap;
extern crate log;
extern crate rand;
extern crate storage_agent;
extern crate storage_core;
extern crate uuid;

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use log::LevelFilter;
use rand::Rng;

use storage_agent::{logging, refresh};
use storage_core::config::Config;

fn main() {
    let matches = App::new("turku-storage-update-config")
        .about("Publishes volume capacity and rewrites the authorized_keys file")
        .arg(
            Arg::with_name("config-dir")
                .short("c")
                .long("config-dir")
                .takes_value(true)
                .default_value("/etc/turku-storage"),
        )
        .arg(
            Arg::with_name("wait")
                .short("w")
                .long("wait")
                .takes_value(true)
                .help("sleep a uniform random [0, WAIT_SEC] before starting, to spread fleet load"),
        )
        .arg(Arg::with_name("api-auth-name").long("api-auth-name").takes_value(true))
        .arg(Arg::with_name("api-auth-secret").long("api-auth-secret").takes_value(true))
        .arg(Arg::with_name("debug").long("debug"))
        .get_matches();

    let config_dir = PathBuf::from(matches.value_of("config-dir").unwrap());
    let api_auth_name = matches.value_of("api-auth-name");
    let api_auth_secret = matches.value_of("api-auth-secret");
    let debug = matches.is_present("debug");

    if let Some(wait_sec) = matches.value_of("wait").and_then(|s| s.parse::<f64>().ok()) {
        let delay = rand::thread_rng().gen_range(0.0..wait_sec.max(0.0001));
        thread::sleep(Duration::from_secs_f64(delay));
    }

    if let Err(e) = run(&config_dir, api_auth_name, api_auth_secret, debug) {
        eprintln!("turku-storage-update-config: {}", e);
        process::exit(1);
    }
}

fn run(config_dir: &std::path::Path, api_auth_name: Option<&str>, api_auth_secret: Option<&str>, debug: bool) -> storage_agent::Result<()> {
    let config = Config::load(config_dir, true)?;

    let session_id = uuid::Uuid::new_v4();
    let console_level = if debug { LevelFilter::Debug } else { LevelFilter::Error };
    logging::init(&config.log_file, console_level, session_id)?;

    refresh::run(&config, api_auth_name, api_auth_secret)
}
