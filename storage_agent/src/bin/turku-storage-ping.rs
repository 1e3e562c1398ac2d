extern crate clap;
extern crate log;
extern crate storage_agent;
extern crate storage_core;
extern crate uuid;

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process;

use clap::{App, Arg};
use log::LevelFilter;

use storage_agent::{logging, session};
use storage_core::config::Config;

fn main() {
    let matches = App::new("turku-storage-ping")
        .about("Drives one backup session for a remote machine over a forwarded tunnel")
        .arg(
            Arg::with_name("config-dir")
                .short("c")
                .long("config-dir")
                .takes_value(true)
                .default_value("/etc/turku-storage"),
        )
        .arg(Arg::with_name("uuid").required(true).index(1))
        .get_matches();

    let config_dir = PathBuf::from(matches.value_of("config-dir").unwrap());
    let uuid = matches.value_of("uuid").unwrap().to_string();

    if let Err(e) = run(&config_dir, &uuid) {
        eprintln!("turku-storage-ping: {}", e);
        process::exit(1);
    }
}

fn run(config_dir: &std::path::Path, uuid: &str) -> storage_agent::Result<()> {
    let config = Config::load(config_dir, false)?;

    let mut stdin = BufReader::new(io::stdin());
    let handshake = session::read_handshake(&mut stdin)?;

    let session_id = uuid::Uuid::new_v4();
    let console_level = if handshake.verbose { LevelFilter::Info } else { LevelFilter::Error };
    logging::init(&config.log_file, console_level, session_id)?;

    session::run(&config, uuid, handshake)
}
