use serde_derive::Deserialize;
use skein::env::Env;
use std::collections::HashMap;
use std::path::Path;
use strand::logging::LoggerConfig;

/// Boot configuration, loaded from a TOML file. Every recognised key also
/// lands in the runtime env store so services can read it through GETENV;
/// unrecognised string keys are passed through untouched.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker thread count; defaults to the core count.
    pub thread: Option<usize>,
    /// Node id (0 = standalone).
    pub harbor: u8,
    /// Cluster-stub knobs, passed through to the harbor service.
    pub address: String,
    pub master: String,
    pub standalone: String,
    /// Native module search path, `?`-wildcard, `;`-separated.
    pub cpath: String,
    /// Bootstrap logger sink: file path, empty for the console.
    pub logger: String,
    /// Module implementing the logger service.
    pub logservice: String,
    /// First service command.
    pub bootstrap: String,
    /// Bootstrap script name, read by the bootstrap service.
    pub start: String,
    pub lua_path: String,
    pub lua_cpath: String,
    pub luaservice: String,
    pub lualoader: String,
    pub preload: String,
    /// Per-service CPU accounting.
    pub profile: bool,
    /// Script interpreter memory cap in bytes (0 = unlimited).
    pub memlimit: usize,
    /// Root logger for the runtime's own diagnostics.
    pub logging: Option<LoggerConfig>,
    #[serde(flatten)]
    pub extra: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            thread: None,
            harbor: 0,
            address: String::new(),
            master: String::new(),
            standalone: String::new(),
            cpath: "./cservice/?.so".to_owned(),
            logger: String::new(),
            logservice: "logger".to_owned(),
            bootstrap: "sandbox bootstrap".to_owned(),
            start: "main".to_owned(),
            lua_path: String::new(),
            lua_cpath: String::new(),
            luaservice: String::new(),
            lualoader: String::new(),
            preload: String::new(),
            profile: false,
            memlimit: 0,
            logging: None,
            extra: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// Push every key into the env store for GETENV consumers.
    pub fn seed_env(&self, env: &Env) {
        let mut pairs: Vec<(String, String)> = vec![
            ("harbor".to_owned(), self.harbor.to_string()),
            ("cpath".to_owned(), self.cpath.clone()),
            ("logger".to_owned(), self.logger.clone()),
            ("logservice".to_owned(), self.logservice.clone()),
            ("bootstrap".to_owned(), self.bootstrap.clone()),
            ("start".to_owned(), self.start.clone()),
            ("profile".to_owned(), (self.profile as u8).to_string()),
        ];
        if let Some(thread) = self.thread {
            pairs.push(("thread".to_owned(), thread.to_string()));
        }
        if self.memlimit > 0 {
            pairs.push(("memlimit".to_owned(), self.memlimit.to_string()));
        }
        for (key, value) in &[
            ("address", &self.address),
            ("master", &self.master),
            ("standalone", &self.standalone),
            ("lua_path", &self.lua_path),
            ("lua_cpath", &self.lua_cpath),
            ("luaservice", &self.luaservice),
            ("lualoader", &self.lualoader),
            ("preload", &self.preload),
        ] {
            if !value.is_empty() {
                pairs.push(((*key).to_owned(), (*value).clone()));
            }
        }
        for (key, value) in &self.extra {
            pairs.push((key.clone(), value.clone()));
        }
        env.seed(pairs);
    }
}
