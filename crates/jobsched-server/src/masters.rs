use std::path::Path;

use anyhow::Context;
use jobsched_scheduler::ScheduleMaster;

/// Read the statically configured masters (a JSON array) from `path`.
pub fn load_masters(path: &Path) -> anyhow::Result<Vec<ScheduleMaster>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading masters file {}", path.display()))?;
    let masters: Vec<ScheduleMaster> = serde_json::from_str(&text)
        .with_context(|| format!("parsing masters file {}", path.display()))?;
    Ok(masters)
}
