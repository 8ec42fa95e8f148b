use hashbrown::HashMap;
use parking_lot::RwLock;

/// Process-wide key/value store behind the GETENV/SETENV commands. Seeded
/// from the boot config; services use it for bootstrap parameters and the
/// sandbox path variables.
pub struct Env {
    values: RwLock<HashMap<String, String>>,
}

impl Env {
    pub fn new() -> Env {
        Env {
            values: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    #[inline]
    pub fn get_or<'a>(&self, key: &str, default: &'a str) -> String {
        match self.get(key) {
            Some(value) => value,
            None => default.to_owned(),
        }
    }

    /// Numeric convenience used by threshold knobs.
    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        match self.get(key) {
            Some(value) => value.parse().unwrap_or(default),
            None => default,
        }
    }

    #[inline]
    pub fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_owned(), value.to_owned());
    }

    pub fn seed<I, K, V>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut values = self.values.write();
        for (key, value) in pairs {
            values.insert(key.into(), value.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let env = Env::new();
        assert_eq!(env.get("thread"), None);
        env.set("thread", "8");
        assert_eq!(env.get("thread").as_deref(), Some("8"));
        assert_eq!(env.get_or("missing", "x"), "x");
    }

    #[test]
    fn test_get_usize_fallback() {
        let env = Env::new();
        env.set("mq_overload", "2048");
        env.set("broken", "not-a-number");
        assert_eq!(env.get_usize("mq_overload", 1024), 2048);
        assert_eq!(env.get_usize("broken", 1024), 1024);
        assert_eq!(env.get_usize("absent", 1024), 1024);
    }

    #[test]
    fn test_seed_overwrites() {
        let env = Env::new();
        env.set("start", "old");
        env.seed(vec![("start", "main"), ("harbor", "0")]);
        assert_eq!(env.get("start").as_deref(), Some("main"));
        assert_eq!(env.get("harbor").as_deref(), Some("0"));
    }
}
