//! Static catalog of the supported text-mining tools.
//!
//! Each [`Tool`] maps to a [`ToolDefinition`]: the ordered stage chain, the
//! networks and services to provision, the reconciliation patterns and the
//! reduction plan.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::NetworkAttachment;
use crate::pipeline::stage::{BindSpec, StageDescriptor};
use crate::provision::{NetworkSpec, ServiceSpec};

const ALIGN_IMAGE: &str = "itextmine/align";

/// A supported tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Rlimsp,
    Mirtex,
    Efip,
    Egard,
}

impl Tool {
    /// Every supported tool.
    pub const ALL: [Tool; 4] = [Tool::Rlimsp, Tool::Mirtex, Tool::Efip, Tool::Egard];

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Rlimsp => "rlimsp",
            Tool::Mirtex => "mirtex",
            Tool::Efip => "efip",
            Tool::Egard => "egard",
        }
    }

    /// Name of the container running `stage` for `task`.
    pub fn container_name(&self, stage: &str, task: &str) -> String {
        format!("{}-{}-{}", self.name(), stage, task)
    }

    /// Builds the full definition of this tool.
    pub fn definition(&self) -> ToolDefinition {
        match self {
            Tool::Rlimsp => rlimsp(),
            Tool::Mirtex => mirtex(),
            Tool::Efip => efip(),
            Tool::Egard => egard(),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tool::ALL
            .into_iter()
            .find(|tool| tool.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownTool(s.to_string()))
    }
}

/// One artifact concatenated across task units at reduction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPlan {
    /// Artifact path relative to the task unit.
    pub artifact: String,
    /// Tool prefix of the output file name.
    pub prefix: String,
    /// Artifact kind in the output file name.
    pub kind: String,
    /// Every task unit must carry this artifact.
    pub required: bool,
}

impl ArtifactPlan {
    fn new(artifact: &str, prefix: &str, kind: &str, required: bool) -> Self {
        Self {
            artifact: artifact.to_string(),
            prefix: prefix.to_string(),
            kind: kind.to_string(),
            required,
        }
    }

    /// Output file name, `<prefix>.<collection>.<kind>.json`.
    pub fn output_name(&self, collection: &str) -> String {
        format!("{}.{}.{}.json", self.prefix, collection, self.kind)
    }
}

/// Copies one artifact per task into a downstream tool's task layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestagePlan {
    /// Artifact copied out of every task unit.
    pub artifact: String,
    /// Tool whose task root receives the copies.
    pub downstream: Tool,
}

/// Everything the orchestrator needs to know about a tool.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub tool: Tool,
    /// Stage chain, in execution order.
    pub stages: Vec<StageDescriptor>,
    /// Networks (with their services) provisioned once per run.
    pub networks: Vec<NetworkSpec>,
    /// Whether database parameters are mandatory.
    pub needs_database: bool,
    /// Whether task units come from splitting an input document.
    pub partitioned: bool,
    pub reduction: Vec<ArtifactPlan>,
    pub restage: Option<RestagePlan>,
}

impl ToolDefinition {
    /// Directory holding this tool's task units.
    ///
    /// Partitioned tools live under `<workdir>/<tool>`; `efip` runs over the
    /// tree re-staged for the collection.
    pub fn task_root(&self, workdir: &Path, collection: &str) -> PathBuf {
        if self.partitioned {
            workdir.join(self.tool.name())
        } else {
            workdir.join(format!("{}_{}_input", self.tool.name(), collection))
        }
    }

    /// Container name patterns removed before a run.
    pub fn container_patterns(&self) -> Vec<String> {
        let mut patterns = vec![format!("{}-*", self.tool.name())];
        patterns.extend(self.service_names());
        patterns
    }

    /// Names of all networks the tool provisions.
    pub fn network_names(&self) -> Vec<String> {
        self.networks.iter().map(|n| n.name.clone()).collect()
    }

    /// Names of all auxiliary services the tool provisions.
    pub fn service_names(&self) -> Vec<String> {
        self.networks
            .iter()
            .flat_map(|n| n.services.iter().map(|s| s.name.clone()))
            .collect()
    }

    /// Distinct images used by stages and services.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        let all = self
            .networks
            .iter()
            .flat_map(|n| n.services.iter().map(|s| s.image.clone()))
            .chain(self.stages.iter().map(|s| s.image.clone()));
        for image in all {
            if !images.contains(&image) {
                images.push(image);
            }
        }
        images
    }

    /// Number of stages per task, the upper bound of events per task.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

fn rlimsp() -> ToolDefinition {
    ToolDefinition {
        tool: Tool::Rlimsp,
        stages: vec![
            StageDescriptor::hard("rlimsp", "itextmine/rlimsp", "output.json")
                .with_binds(vec![
                    BindSpec::input("input.json", "/rlims_workdir/in.json").read_only(),
                    BindSpec::output("output.json", "/rlims_workdir/out.json"),
                    BindSpec::output("output.txt", "/rlims_workdir/out.txt"),
                ])
                .with_network(NetworkAttachment::dynamic("rlimsp")),
            align_stage("align", "output.json", "align.json"),
            StageDescriptor::soft("efip", "leebird/efip", "efip_output.json").with_binds(vec![
                BindSpec::input("output.txt", "/efip_workdir/docs.rlims.txt").read_only(),
                BindSpec::output("efip_output.json", "/efip_workdir/docs.json"),
            ]),
            align_stage("efip-align", "efip_output.json", "efip_align.json"),
        ],
        networks: vec![NetworkSpec::new("rlimsp", "10.0.0.0/16").with_service(
            ServiceSpec::new("rlimsp-mysql", "itextmine/rlimsp-mysql", "10.0.0.2"),
        )],
        needs_database: false,
        partitioned: true,
        reduction: vec![
            ArtifactPlan::new("align.json", "rlimsp", "align", true),
            ArtifactPlan::new("efip_output.json", "efip", "output", false),
            ArtifactPlan::new("efip_align.json", "efip", "aligned", false),
        ],
        restage: Some(RestagePlan {
            artifact: "output.txt".to_string(),
            downstream: Tool::Efip,
        }),
    }
}

fn mirtex() -> ToolDefinition {
    ToolDefinition {
        tool: Tool::Mirtex,
        stages: vec![
            StageDescriptor::soft("mirtex", "itextmine/mirtex", "output.json").with_binds(vec![
                BindSpec::input("input.json", "/mirtex_workdir/in.json").read_only(),
                BindSpec::output("output.json", "/mirtex_workdir/out.json"),
            ]),
            align_stage("align", "output.json", "align.json"),
        ],
        networks: Vec::new(),
        needs_database: false,
        partitioned: true,
        reduction: vec![
            ArtifactPlan::new("output.json", "mirtex", "output", false),
            ArtifactPlan::new("align.json", "mirtex", "aligned", false),
        ],
        restage: None,
    }
}

fn efip() -> ToolDefinition {
    ToolDefinition {
        tool: Tool::Efip,
        stages: vec![
            StageDescriptor::soft("efip", "leebird/efip", "efip_output.json").with_binds(vec![
                BindSpec::input("output.txt", "/efip_workdir/docs.rlims.txt").read_only(),
                BindSpec::output("efip_output.json", "/efip_workdir/docs.json"),
            ]),
        ],
        networks: Vec::new(),
        needs_database: false,
        partitioned: false,
        reduction: vec![ArtifactPlan::new("efip_output.json", "efip", "output", false)],
        restage: None,
    }
}

fn egard() -> ToolDefinition {
    ToolDefinition {
        tool: Tool::Egard,
        stages: vec![StageDescriptor::hard(
            "bionex",
            "itextmine/bionex",
            "bionex/output.json",
        )
        .with_subdir("bionex")
        .with_binds(vec![
            BindSpec::input("input.json", "/bionex_workdir/in.json").read_only(),
            BindSpec::output("bionex/output.json", "/bionex_workdir/out.json"),
            BindSpec::output("bionex/output.txt", "/bionex_workdir/out.txt"),
        ])
        .with_network(NetworkAttachment::dynamic("egard_rlimsp_net"))
        .with_database_env()],
        networks: vec![
            NetworkSpec::new("egard_rlimsp_net", "10.0.0.0/16").with_service(ServiceSpec::new(
                "egard-rlimsp-mysql",
                "itextmine/rlimsp-mysql",
                "10.0.0.2",
            )),
            NetworkSpec::new("mace2k_net", "192.168.0.0/16").with_service(ServiceSpec::new(
                "mace2k-mysql",
                "itextmine/rlimsp-mysql",
                "192.168.0.2",
            )),
        ],
        needs_database: true,
        partitioned: true,
        reduction: vec![ArtifactPlan::new("bionex/output.json", "egard", "bionex", true)],
        restage: None,
    }
}

/// Alignment of a tool result against the original documents.
fn align_stage(name: &str, result: &str, aligned: &str) -> StageDescriptor {
    StageDescriptor::soft(name, ALIGN_IMAGE, aligned).with_binds(vec![
        BindSpec::input("input.json", "/align_workdir/origin_file.json").read_only(),
        BindSpec::input(result, "/align_workdir/result_file.json").read_only(),
        BindSpec::output(aligned, "/align_workdir/output_file.json"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::StageKind;

    #[test]
    fn test_tool_from_str() {
        assert_eq!("rlimsp".parse::<Tool>().expect("parse"), Tool::Rlimsp);
        assert_eq!("MiRTex".parse::<Tool>().expect("parse"), Tool::Mirtex);
        assert!(matches!(
            "pubtator".parse::<Tool>(),
            Err(ConfigError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_rlimsp_chain() {
        let def = Tool::Rlimsp.definition();
        let names: Vec<&str> = def.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["rlimsp", "align", "efip", "efip-align"]);
        assert_eq!(def.stages[0].kind, StageKind::Hard);
        assert!(def.stages[1..].iter().all(|s| s.kind == StageKind::Soft));
        assert_eq!(def.network_names(), vec!["rlimsp".to_string()]);
        assert_eq!(
            def.container_patterns(),
            vec!["rlimsp-*".to_string(), "rlimsp-mysql".to_string()]
        );
        assert_eq!(def.tool.container_name("align", "task_3"), "rlimsp-align-task_3");
    }

    #[test]
    fn test_images_are_deduplicated() {
        let def = Tool::Rlimsp.definition();
        let images = def.images();
        assert_eq!(
            images,
            vec![
                "itextmine/rlimsp-mysql".to_string(),
                "itextmine/rlimsp".to_string(),
                "itextmine/align".to_string(),
                "leebird/efip".to_string(),
            ]
        );
    }

    #[test]
    fn test_task_roots() {
        let workdir = Path::new("/w");
        assert_eq!(
            Tool::Mirtex.definition().task_root(workdir, "pmc"),
            PathBuf::from("/w/mirtex")
        );
        assert_eq!(
            Tool::Efip.definition().task_root(workdir, "pmc"),
            PathBuf::from("/w/efip_pmc_input")
        );
    }

    #[test]
    fn test_egard_definition() {
        let def = Tool::Egard.definition();
        assert!(def.needs_database);
        assert_eq!(def.stages[0].subdir.as_deref(), Some("bionex"));
        assert!(def.stages[0].database_env);
        assert_eq!(
            def.service_names(),
            vec!["egard-rlimsp-mysql".to_string(), "mace2k-mysql".to_string()]
        );
        assert_eq!(def.reduction[0].output_name("abs"), "egard.abs.bionex.json");
    }

    #[test]
    fn test_efip_restage_target_matches_efip_root() {
        let rlimsp = Tool::Rlimsp.definition();
        let plan = rlimsp.restage.expect("restage plan");
        assert_eq!(plan.downstream, Tool::Efip);
        assert_eq!(plan.artifact, "output.txt");
    }
}
