use anyhow::Result;

use crate::orchestrator::ProjectSummary;

pub fn to_string(summaries: &[ProjectSummary]) -> Result<String> {
    Ok(serde_json::to_string_pretty(summaries)?)
}

pub fn render(summaries: &[ProjectSummary]) -> Result<()> {
    println!("{}", to_string(summaries)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{PluginState, PluginSummary};
    use std::path::PathBuf;

    #[test]
    fn test_json_shape() {
        let summary = ProjectSummary {
            project: PathBuf::from("/tmp/web"),
            repo: Some("https://github.com/acme/web".into()),
            product: None,
            plugins: vec![PluginSummary {
                name: "Node.js".into(),
                state: PluginState::Recovered,
                detected: true,
                dependencies_added: 3,
                declared: 4,
                total: 7,
                errored: false,
                manifest: Some(PathBuf::from("/tmp/web/package.json")),
                error: None,
            }],
        };

        let value: serde_json::Value =
            serde_json::from_str(&to_string(&[summary]).unwrap()).unwrap();

        let project = &value[0];
        assert_eq!(project["repo"], "https://github.com/acme/web");
        assert!(project.get("product").is_none());
        assert_eq!(project["plugins"][0]["state"], "recovered");
        assert_eq!(project["plugins"][0]["dependencies_added"], 3);
        assert!(project["plugins"][0]["error"].is_null());
    }
}
