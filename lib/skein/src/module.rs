use crate::error::ModuleError;
use crate::service::Service;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use libloading::Library;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use strand::logging::{self, Logger};

/// Factory signature for services compiled into the runtime.
pub type BuiltinFactory = fn() -> Box<dyn Service>;

/// Entry point a dynamically loaded service module must export. The
/// contract is same-toolchain Rust: the library hands back a boxed trait
/// object and the runtime drives it exactly like a builtin.
pub const CREATE_SYMBOL: &[u8] = b"skein_service_create";

type CreateFn = unsafe extern "Rust" fn() -> Box<dyn Service>;

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, BuiltinFactory> = {
        let mut map: HashMap<&'static str, BuiltinFactory> = HashMap::new();
        map.insert("logger", crate::services::logger::create);
        map.insert("gate", crate::services::gate::create);
        map.insert("launcher", crate::services::launcher::create);
        map.insert("harbor", crate::services::harbor::create);
        map.insert("sandbox", crate::sandbox::create);
        map
    };
}

struct DynModule {
    name: String,
    lib: Library,
}

impl DynModule {
    fn instantiate(&self) -> Result<Box<dyn Service>, ModuleError> {
        unsafe {
            let create = self
                .lib
                .get::<CreateFn>(CREATE_SYMBOL)
                .map_err(|_| ModuleError::MissingSymbol {
                    name: self.name.clone(),
                    symbol: "skein_service_create",
                })?;
            Ok(create())
        }
    }
}

/// Resolves module names to service factories: builtins first, then shared
/// libraries found on the `cpath` pattern list (`?` placeholder, `;`
/// separated). Loaded libraries are cached; double-load returns the cached
/// entry.
pub struct ModuleLoader {
    cpath: String,
    loaded: Mutex<HashMap<String, Arc<DynModule>>>,
    log: Logger,
}

impl ModuleLoader {
    pub fn new(cpath: &str, log: Logger) -> ModuleLoader {
        ModuleLoader {
            cpath: cpath.to_owned(),
            loaded: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Service>, ModuleError> {
        if let Some(factory) = BUILTINS.get(name) {
            return Ok(factory());
        }
        self.load(name)?.instantiate()
    }

    pub fn is_builtin(name: &str) -> bool {
        BUILTINS.contains_key(name)
    }

    fn load(&self, name: &str) -> Result<Arc<DynModule>, ModuleError> {
        let mut loaded = self.loaded.lock();

        if let Some(module) = loaded.get(name) {
            return Ok(module.clone());
        }

        let path = resolve(&self.cpath, name).ok_or_else(|| ModuleError::NotFound {
            name: name.to_owned(),
            searched: self.cpath.clone(),
        })?;

        logging::info!(self.log, "loading service module";
                       "module" => name,
                       "path" => %path.display());

        let lib = unsafe {
            Library::new(&path).map_err(|source| ModuleError::Load {
                name: name.to_owned(),
                source,
            })?
        };

        let module = Arc::new(DynModule {
            name: name.to_owned(),
            lib,
        });

        // Fail fast on a library that lacks the entry point.
        module.instantiate().map(drop)?;

        loaded.insert(name.to_owned(), module.clone());
        Ok(module)
    }
}

/// Expand each `?` pattern with the module name and return the first path
/// that exists on disk.
fn resolve(cpath: &str, name: &str) -> Option<PathBuf> {
    cpath
        .split(';')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| PathBuf::from(pattern.replace('?', name)))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_builtins_present() {
        for name in &["logger", "gate", "launcher", "harbor", "sandbox"] {
            assert!(ModuleLoader::is_builtin(name), "missing builtin {}", name);
        }
        assert!(!ModuleLoader::is_builtin("nonesuch"));
    }

    #[test]
    fn test_builtin_create() {
        let loader = ModuleLoader::new("", logging::discard());
        assert!(loader.create("harbor").is_ok());
    }

    #[test]
    fn test_resolve_pattern_expansion() {
        let dir = std::env::temp_dir().join("skein_module_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("demo.so");
        fs::write(&path, b"").unwrap();

        let cpath = format!("./missing/?.so;{}/?.so", dir.display());
        assert_eq!(resolve(&cpath, "demo"), Some(path.clone()));
        assert_eq!(resolve(&cpath, "absent"), None);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_unknown_module_reports_search_path() {
        let loader = ModuleLoader::new("./a/?.so;./b/?.so", logging::discard());
        match loader.create("ghost") {
            Err(ModuleError::NotFound { name, searched }) => {
                assert_eq!(name, "ghost");
                assert!(searched.contains("./a/?.so"));
            }
            other => panic!("unexpected result {:?}", other.map(drop)),
        }
    }
}
