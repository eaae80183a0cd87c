fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Queued(info) => {
            debug!(seq = info.seq, kind = ?info.kind, id = %info.target_id, "transfer queued");
        }
        CoordinatorEvent::FirstStarted => info!("transfers started"),
        CoordinatorEvent::Started(info) => {
            debug!(seq = info.seq, kind = ?info.kind, id = %info.target_id, "transfer starting");
        }
        CoordinatorEvent::Finished(info) => match info.failure.as_deref() {
            Some(failure) => warn!(
                seq = info.seq,
                kind = ?info.kind,
                id = %info.target_id,
                status = ?info.status,
                error = failure,
                "transfer finished with failure"
            ),
            None => info!(
                seq = info.seq,
                kind = ?info.kind,
                id = %info.target_id,
                status = ?info.status,
                "transfer finished"
            ),
        },
        CoordinatorEvent::Drained => info!("all transfers finished"),
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn default_download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("files")
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
