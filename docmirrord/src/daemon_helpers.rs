fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Parses `local[=prefix]` entries separated by `;`.
fn parse_roots(value: &str, home: &Path) -> Vec<RootConfig> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (path, prefix) = entry.split_once('=').unwrap_or((entry, ""));
            RootConfig {
                path: expand_with_home(path.trim(), home),
                prefix: prefix.trim().to_string(),
            }
        })
        .collect()
}

/// Parses `field=dir` entries separated by `;`.
fn parse_loads(value: &str, home: &Path) -> anyhow::Result<Vec<LoadConfig>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (field, dir) = entry
                .split_once('=')
                .with_context(|| format!("DOCMIRROR_LOAD entry {entry:?} is not field=dir"))?;
            Ok(LoadConfig {
                field: field.trim().to_string(),
                dir: expand_with_home(dir.trim(), home),
            })
        })
        .collect()
}

/// Builds the document to publish from the optional body file and the
/// directories loaded into body fields. Store-managed fields in the body file
/// are ignored.
async fn build_document(config: &DaemonConfig) -> anyhow::Result<Document> {
    let mut body = match &config.body_file {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read document body {path:?}"))?;
            match serde_json::from_slice::<Value>(&raw)
                .with_context(|| format!("document body {path:?} is not JSON"))?
            {
                Value::Object(map) => map,
                _ => anyhow::bail!("document body {path:?} must be a JSON object"),
            }
        }
        None => Map::new(),
    };
    for field in ["_id", "_rev", "_attachments"] {
        body.remove(field);
    }

    for load in &config.loads {
        let dir = load.dir.clone();
        let loaded = tokio::task::spawn_blocking(move || load_files(&dir, &[]))
            .await
            .context("loader task panicked")?
            .with_context(|| format!("failed to load {:?} into {}", load.dir, load.field))?;
        body.insert(load.field.clone(), Value::Object(loaded));
    }

    Ok(Document::new(config.doc_id.clone()).with_body(body))
}
