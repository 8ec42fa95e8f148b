mod config;

use config::Config;
use skein::runtime::{Runtime, RuntimeOptions};
use std::env;
use std::process;
use strand::logging::{self, Level};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let config_path = match env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: skein-node <config.toml>");
            return 1;
        }
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot load config {}: {}", config_path, err);
            return 1;
        }
    };

    let log = match &config.logging {
        Some(logging_config) => match logging::from_config(logging_config) {
            Ok(log) => log,
            Err(err) => {
                eprintln!("bad [logging] section: {}", err);
                return 1;
            }
        },
        None => logging::terminal(Level::Info),
    };

    let options = RuntimeOptions {
        node: config.harbor,
        workers: config.thread.unwrap_or_else(num_cpus::get),
        cpath: config.cpath.clone(),
        profile: config.profile,
    };

    let rt = match Runtime::new(options, log.clone()) {
        Ok(rt) => rt,
        Err(err) => {
            logging::crit!(log, "runtime construction failed"; "error" => %err);
            return 1;
        }
    };

    config.seed_env(rt.env());
    rt.start();

    if let Err(err) = rt.bootstrap() {
        logging::crit!(log, "bootstrap failed"; "error" => %err);
        rt.initiate_shutdown(1);
        rt.wait();
        return 1;
    }

    logging::info!(log, "node up";
                   "workers" => config.thread.unwrap_or_else(num_cpus::get),
                   "harbor" => config.harbor);

    rt.wait()
}
