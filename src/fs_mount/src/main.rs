mod fs_mount;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::fs_mount::{run_fs_mount, FsMountRunOptions, DEFAULT_HUB_URL};

fn usage() -> String {
    format!(
        "usage: fs_mount <mountpoint> [--server <url>] [--config <path>] [--token <token>]\n\
         defaults:\n\
         --server {}\n\
         --config none (browse the whole hub)",
        DEFAULT_HUB_URL
    )
}

fn parse_args() -> Result<FsMountRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mountpoint = PathBuf::from(args[0].clone());
    let mut server_url = DEFAULT_HUB_URL.to_string();
    let mut config_path = None;
    let mut session_token = None;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--server" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --server".to_string())?;
                server_url = value.clone();
            }
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--token" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --token".to_string())?;
                session_token = Some(value.clone());
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(FsMountRunOptions {
        mountpoint,
        server_url,
        config_path,
        session_token,
    })
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_fs_mount(options) {
        error!("run fs_mount failed: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod fs_mount_tests;
