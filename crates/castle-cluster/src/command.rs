//! Monitor command builder

use serde_json::{Map, Value};

/// A monitor command
///
/// Arguments are kept in insertion order so the same command renders both
/// as the JSON form (`{"prefix": .., "format": "json", ..}`) and as the
/// equivalent `ceph` CLI words.
#[derive(Debug, Clone, PartialEq)]
pub struct MonCommand {
    prefix: String,
    args: Vec<(String, Value, bool)>,
}

impl MonCommand {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            args: Vec::new(),
        }
    }

    /// Add an argument that is also a positional CLI word
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((key.into(), value.into(), true));
        self
    }

    /// Add an argument that only appears in the JSON form
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((key.into(), value.into(), false));
        self
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Value of an argument by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.iter().find(|(k, _, _)| k == key).map(|(_, v, _)| v)
    }

    /// String value of an argument by key
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// JSON form, always with `format: "json"`
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("prefix".to_string(), Value::String(self.prefix.clone()));
        map.insert("format".to_string(), Value::String("json".to_string()));
        for (key, value, _) in &self.args {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// CLI words: the prefix split on spaces, then positional arguments
    #[must_use]
    pub fn cli_args(&self) -> Vec<String> {
        let mut words: Vec<String> = self.prefix.split_whitespace().map(str::to_string).collect();
        for (_, value, positional) in &self.args {
            if *positional {
                push_words(&mut words, value);
            }
        }
        words
    }
}

fn push_words(words: &mut Vec<String>, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => words.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| push_words(words, v)),
        other => words.push(other.to_string()),
    }
}

impl std::fmt::Display for MonCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cli_args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_and_cli_forms() {
        let cmd = MonCommand::new("auth add")
            .arg("entity", "osd.3")
            .arg("caps", vec!["osd", "allow *", "mon", "allow profile osd"]);
        assert_eq!(
            cmd.to_json(),
            json!({
                "prefix": "auth add",
                "format": "json",
                "entity": "osd.3",
                "caps": ["osd", "allow *", "mon", "allow profile osd"],
            })
        );
        assert_eq!(
            cmd.cli_args(),
            vec!["auth", "add", "osd.3", "osd", "allow *", "mon", "allow profile osd"]
        );
    }

    #[test]
    fn test_json_only_fields() {
        let cmd = MonCommand::new("osd create")
            .field("entity", "client.bootstrap-osd")
            .arg("uuid", "1234");
        assert_eq!(cmd.cli_args(), vec!["osd", "create", "1234"]);
        assert_eq!(cmd.get_str("entity"), Some("client.bootstrap-osd"));
        assert_eq!(cmd.to_string(), "osd create 1234");
    }

    #[test]
    fn test_numeric_args() {
        let cmd = MonCommand::new("osd crush create-or-move")
            .arg("id", 3)
            .arg("weight", 0.0009)
            .arg("args", vec!["hostName=a", "root=default"]);
        assert_eq!(cmd.to_json()["id"], json!(3));
        assert_eq!(
            cmd.cli_args(),
            vec!["osd", "crush", "create-or-move", "3", "0.0009", "hostName=a", "root=default"]
        );
    }
}
