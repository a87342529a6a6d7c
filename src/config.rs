//! Server configuration: set once at startup from CLI flags, read-only
//! thereafter. See spec §3, §6.

use std::path::PathBuf;

use crate::args::named_option;

pub const DEFAULT_PORT: u16 = 6379;
const DEFAULT_DIR: &str = "/tmp";
const DEFAULT_DBFILENAME: &str = "dump.rdb";

#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub dbfilename: String,
    pub port: u16,
}

impl Config {
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let port = named_option::<u16>(args, "--port")?.unwrap_or(DEFAULT_PORT);
        let dir = named_option::<String>(args, "--dir")?.unwrap_or_else(|| DEFAULT_DIR.to_string());
        let dbfilename =
            named_option::<String>(args, "--dbfilename")?.unwrap_or_else(|| DEFAULT_DBFILENAME.to_string());

        Ok(Config { dir: PathBuf::from(dir), dbfilename, port })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }
}
