use super::SynthError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Speaker table of a multi-speaker model: plain ids, and for d-vector
/// models the stored embeddings grouped by speaker name.
#[derive(Debug, Clone, Default)]
pub struct SpeakerManager {
    ids: BTreeMap<String, i64>,
    embeddings: BTreeMap<String, Vec<Vec<f32>>>,
}

impl SpeakerManager {
    pub fn from_ids(ids: BTreeMap<String, i64>) -> Self {
        Self {
            ids,
            embeddings: BTreeMap::new(),
        }
    }

    /// Builds the table from `(speaker name, embedding)` pairs. Ids are
    /// assigned in sorted name order.
    pub fn from_embeddings(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Self {
        let mut embeddings: BTreeMap<String, Vec<Vec<f32>>> = BTreeMap::new();
        for (name, embedding) in entries {
            embeddings.entry(name).or_default().push(embedding);
        }
        let ids = embeddings
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as i64))
            .collect();
        Self { ids, embeddings }
    }

    /// Reads a speakers file: either `{"name": id}` or a d-vector table
    /// `{"clip": {"name": ..., "embedding": [...]}}`.
    pub fn load(path: &Path) -> Result<Self, SynthError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|message| SynthError::Config {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let json: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
        let obj = json
            .as_object()
            .ok_or_else(|| "speakers file must be a JSON object".to_string())?;

        if obj.values().all(Value::is_number) {
            let ids = obj
                .iter()
                .map(|(name, id)| {
                    id.as_i64()
                        .map(|id| (name.clone(), id))
                        .ok_or_else(|| format!("speaker id for '{}' is not an integer", name))
                })
                .collect::<Result<_, _>>()?;
            return Ok(Self::from_ids(ids));
        }

        let mut entries = Vec::with_capacity(obj.len());
        for (clip, entry) in obj {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("d-vector entry '{}' has no name", clip))?;
            let embedding = entry
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| format!("d-vector entry '{}' has no embedding", clip))?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| format!("d-vector entry '{}' has a non-numeric embedding", clip))?;
            entries.push((name.to_string(), embedding));
        }
        Ok(Self::from_embeddings(entries))
    }

    pub fn id(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ids.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn embeddings_by_name(&self, name: &str) -> Option<&[Vec<f32>]> {
        self.embeddings.get(name).map(Vec::as_slice)
    }

    /// Element-wise mean of every stored embedding of `name`.
    pub fn mean_embedding(&self, name: &str) -> Option<Vec<f32>> {
        let all = self.embeddings.get(name)?;
        let dim = all.first()?.len();
        let mut mean = vec![0.0f32; dim];
        for embedding in all {
            for (m, v) in mean.iter_mut().zip(embedding) {
                *m += v;
            }
        }
        let n = all.len() as f32;
        mean.iter_mut().for_each(|m| *m /= n);
        Some(mean)
    }
}

/// Language table of a multi-lingual model.
#[derive(Debug, Clone, Default)]
pub struct LanguageManager {
    ids: BTreeMap<String, i64>,
}

impl LanguageManager {
    pub fn from_ids(ids: BTreeMap<String, i64>) -> Self {
        Self { ids }
    }

    pub fn load(path: &Path) -> Result<Self, SynthError> {
        let content = std::fs::read_to_string(path)?;
        let ids: BTreeMap<String, i64> =
            serde_json::from_str(&content).map_err(|e| SynthError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self { ids })
    }

    pub fn id(&self, name: &str) -> Option<i64> {
        self.ids.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ids.keys().map(String::as_str)
    }

    /// Reverse lookup, used to pick the phonemizer voice for an id.
    pub fn name(&self, id: i64) -> Option<&str> {
        self.ids
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_table() {
        let m = SpeakerManager::parse(r#"{"amir": 0, "effi": 1}"#).unwrap();
        assert_eq!(m.id("effi"), Some(1));
        assert_eq!(m.id("nobody"), None);
        assert!(m.mean_embedding("amir").is_none());
    }

    #[test]
    fn test_parse_d_vector_table_and_mean() {
        let m = SpeakerManager::parse(
            r#"{
                "clip1.wav": {"name": "effi", "embedding": [1.0, 2.0]},
                "clip2.wav": {"name": "effi", "embedding": [3.0, 4.0]},
                "clip3.wav": {"name": "amir", "embedding": [0.5, 0.5]}
            }"#,
        )
        .unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.id("amir"), Some(0));
        assert_eq!(m.id("effi"), Some(1));
        assert_eq!(m.mean_embedding("effi"), Some(vec![2.0, 3.0]));
        assert_eq!(m.embeddings_by_name("effi").unwrap()[0], vec![1.0, 2.0]);
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        assert!(SpeakerManager::parse(r#"{"clip": {"embedding": [1.0]}}"#).is_err());
        assert!(SpeakerManager::parse(r#"[1, 2]"#).is_err());
        assert!(SpeakerManager::parse(r#"{"a": 1.5}"#).is_err());
    }

    #[test]
    fn test_language_ids_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("language_ids.json");
        std::fs::write(&path, r#"{"en": 0, "nl": 1}"#).unwrap();
        let langs = LanguageManager::load(&path).unwrap();
        assert_eq!(langs.id("nl"), Some(1));
        assert_eq!(langs.names().collect::<Vec<_>>(), vec!["en", "nl"]);
        assert_eq!(langs.name(0), Some("en"));
    }
}
