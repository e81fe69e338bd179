use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five Forge stages, in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IdeaRefinement,
    PrdGeneration,
    UxRequirements,
    TechnicalAnalysis,
    ImplementationPlaybook,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::IdeaRefinement,
        Stage::PrdGeneration,
        Stage::UxRequirements,
        Stage::TechnicalAnalysis,
        Stage::ImplementationPlaybook,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage after this one.
    ///
    /// ```
    /// use promptforge::pipeline::Stage;
    ///
    /// assert_eq!(Stage::IdeaRefinement.next(), Some(Stage::PrdGeneration));
    /// assert_eq!(Stage::ImplementationPlaybook.next(), None);
    /// ```
    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::IdeaRefinement => "idea_refinement",
            Stage::PrdGeneration => "prd_generation",
            Stage::UxRequirements => "ux_requirements",
            Stage::TechnicalAnalysis => "technical_analysis",
            Stage::ImplementationPlaybook => "implementation_playbook",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::IdeaRefinement => "Idea Refinement",
            Stage::PrdGeneration => "Product Requirements",
            Stage::UxRequirements => "UX Requirements",
            Stage::TechnicalAnalysis => "Technical Analysis",
            Stage::ImplementationPlaybook => "Implementation Playbook",
        }
    }

    /// Dimensions the quality gate scores for this stage.
    pub fn dimensions(self) -> &'static [&'static str] {
        match self {
            Stage::IdeaRefinement => &["clarity", "problem_definition", "target_audience", "value_proposition"],
            Stage::PrdGeneration => &["completeness", "clarity", "feasibility", "testability"],
            Stage::UxRequirements => &["user_flows", "accessibility", "consistency", "completeness"],
            Stage::TechnicalAnalysis => &["architecture", "scalability", "security", "risk_assessment"],
            Stage::ImplementationPlaybook => &["actionability", "sequencing", "coverage", "estimation"],
        }
    }

    /// Technical analysis is generated by several models and merged.
    pub fn uses_consensus(self) -> bool {
        self == Stage::TechnicalAnalysis
    }

    /// Generation instructions for this stage's artifact.
    pub fn instructions(self) -> &'static str {
        match self {
            Stage::IdeaRefinement => {
                "Refine the product idea below. State the problem, the target users, the core value \
                 proposition, key assumptions and open risks."
            }
            Stage::PrdGeneration => {
                "Write a product requirements document for the refined idea: goals, non-goals, user \
                 stories with acceptance criteria, and success metrics."
            }
            Stage::UxRequirements => {
                "Derive UX requirements from the PRD: primary user flows, screens and their states, \
                 accessibility requirements, and interaction guidelines."
            }
            Stage::TechnicalAnalysis => {
                "Produce a technical analysis: proposed architecture, data model, integrations, \
                 scalability and security considerations, and a risk register."
            }
            Stage::ImplementationPlaybook => {
                "Turn the prior documents into an implementation playbook: ordered milestones, tasks \
                 per milestone with estimates, dependencies, and a verification plan."
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}
