use std::path::PathBuf;

pub(crate) async fn cmd_plan(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let supervisor = super::build_supervisor(&config).await;

    let groups = supervisor.plan().await?;
    if groups.is_empty() {
        println!("No services configured");
        return Ok(());
    }

    for (index, group) in groups.iter().enumerate() {
        let members: Vec<String> = group
            .iter()
            .map(|d| {
                if config.is_disabled(&d.name) {
                    format!("{} ({}, disabled)", d.name, d.kind.as_str())
                } else {
                    format!("{} ({})", d.name, d.kind.as_str())
                }
            })
            .collect();
        println!("Group {}: {}", index, members.join(", "));
    }
    Ok(())
}
