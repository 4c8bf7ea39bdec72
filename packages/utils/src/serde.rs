use serde::{Deserialize, Deserializer};

/// Accepts either `"a, b,c"` (env vars) or `["a", "b", "c"]` (toml), empty entries are dropped
pub fn deserialize_vec_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    let items = match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => s.split(',').map(|s| s.trim().to_string()).collect(),
        StringOrVec::Vec(v) => v,
    };

    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Deserialize)]
    struct Levels {
        #[serde(deserialize_with = "deserialize_vec_string")]
        levels: Vec<String>,
    }

    #[test]
    fn string_or_vec() {
        let levels: Levels =
            serde_json::from_str(r#"{"levels": "info, connector=debug,"}"#).unwrap();
        assert_eq!(levels.levels, ["info", "connector=debug"]);

        let levels: Levels = serde_json::from_str(r#"{"levels": ["warn"]}"#).unwrap();
        assert_eq!(levels.levels, ["warn"]);
    }
}
