//! The travel-planning workflow.
//!
//! A classifier judges whether the request can be planned at all. Blocked
//! requests go to a feasibility advisor; feasible ones get an overall route,
//! then flight and attraction plans in parallel, merged into one summary.

use std::sync::Arc;

use tracing::{info, warn};

use skein_core::config::{AppConfig, ModelConfig, PipelineConfig};
use skein_core::error::{Result, SkeinError};
use skein_core::prompt::{load_prompt_file, PromptTemplate};
use skein_core::traits::{LlmClient, StepAgent};
use skein_core::types::{ChatMessage, Judgment};

use crate::agent::LlmAgent;
use crate::aggregate::aggregate;
use crate::chain::SequentialChain;
use crate::graph::{Branch, CompiledGraph, ExecutionResult, Graph, Node, Value, ValueKind, END, START};

pub const FEASIBILITY_ADVISOR: &str = "TravelFeasibilityAdvisor";
pub const ROUTE_PLANNER: &str = "OverallRoutePlanner";
pub const FLIGHT_ADVISOR: &str = "FlightAdvisor";
pub const ATTRACTION_HIGHLIGHTS: &str = "AttractionHighlights";
pub const ITINERARY_BUILDER: &str = "DailyItineraryBuilder";
pub const GUIDE_CHAIN: &str = "TravelGuideRecommendation";

const FEASIBILITY_ADVISOR_INSTRUCTION: &str = "You assess whether a trip can be planned. \
Explain why the current request cannot be planned, propose concrete changes, \
and list the missing details as clear follow-up questions.";
const ROUTE_PLANNER_INSTRUCTION: &str = "You plan overall travel routes. \
Give a complete route outline with the order of cities or areas, transport choices \
and pacing advice. Keep it practical and logically ordered.";
const FLIGHT_ADVISOR_INSTRUCTION: &str = "You recommend flights and judge prices. \
From the travel dates and departure and arrival cities, advise on flight choices, \
typical price ranges, when to book and how to save. Never invent flight numbers.";
const ATTRACTION_HIGHLIGHTS_INSTRUCTION: &str = "You pick the must-see attractions. \
For the planned route, list the highlights worth the time, with opening-hour and \
ticketing notes where they matter.";
const ITINERARY_BUILDER_INSTRUCTION: &str = "You build day-by-day itineraries. \
Order sights and activities for each day with sensible times, transfers and rest, \
keep the pace under control and offer optional adjustments.";

const CLASSIFY_USER_TEMPLATE: &str = "Trip request: {description}";
const SUMMARY_USER_TEMPLATE: &str = "Plan contents: {content}";

/// The specialist agents the pipeline delegates to.
#[derive(Clone)]
pub struct TravelAgents {
    pub feasibility_advisor: Arc<dyn StepAgent>,
    pub route_planner: Arc<dyn StepAgent>,
    pub flight_advisor: Arc<dyn StepAgent>,
    pub attraction_highlights: Arc<dyn StepAgent>,
    pub itinerary_builder: Arc<dyn StepAgent>,
}

impl TravelAgents {
    /// Every specialist backed by the same model.
    pub fn llm_backed(llm: Arc<dyn LlmClient>, model: &ModelConfig) -> Self {
        let make = |name: &str, instruction: &str| -> Arc<dyn StepAgent> {
            Arc::new(LlmAgent::new(name, instruction, llm.clone(), model.clone()))
        };
        Self {
            feasibility_advisor: make(FEASIBILITY_ADVISOR, FEASIBILITY_ADVISOR_INSTRUCTION),
            route_planner: make(ROUTE_PLANNER, ROUTE_PLANNER_INSTRUCTION),
            flight_advisor: make(FLIGHT_ADVISOR, FLIGHT_ADVISOR_INSTRUCTION),
            attraction_highlights: make(ATTRACTION_HIGHLIGHTS, ATTRACTION_HIGHLIGHTS_INSTRUCTION),
            itinerary_builder: make(ITINERARY_BUILDER, ITINERARY_BUILDER_INSTRUCTION),
        }
    }
}

/// Prompt texts the pipeline is built from.
#[derive(Debug, Clone)]
pub struct PipelinePrompts {
    pub classify_system: String,
    pub blocked_notice: String,
    pub allowed_notice: String,
    pub summary_system: String,
}

impl PipelinePrompts {
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            classify_system: load_prompt_file(&config.prompt_path(&config.classify_prompt))?,
            blocked_notice: load_prompt_file(&config.prompt_path(&config.blocked_notice))?,
            allowed_notice: load_prompt_file(&config.prompt_path(&config.allowed_notice))?,
            summary_system: load_prompt_file(&config.prompt_path(&config.summary_prompt))?,
        })
    }
}

/// Turn the classifier reply into a judgment.
///
/// An unparseable reply is not an error: it becomes the default judgment
/// (not flagged), or a flagged one when `block_on_unparsed` is set.
pub fn parse_judgment(raw: &str, block_on_unparsed: bool) -> Judgment {
    match Judgment::parse(raw) {
        Ok(judgment) => {
            info!(red_flag = judgment.red_flag, "Feasibility judgment parsed");
            judgment
        }
        Err(e) => {
            warn!(error = %e, reply = %raw, block_on_unparsed, "Unparseable feasibility judgment");
            if block_on_unparsed {
                Judgment {
                    red_flag: true,
                    description: "the feasibility check returned an unreadable answer".into(),
                    address: None,
                }
            } else {
                Judgment::default()
            }
        }
    }
}

/// The compiled travel-planning graph plus the guide chain.
pub struct TravelPlanPipeline {
    graph: CompiledGraph,
    guide: SequentialChain,
    max_iterations: usize,
}

impl TravelPlanPipeline {
    /// Load prompts from the configured directory and build the pipeline.
    pub fn build(config: &AppConfig, llm: Arc<dyn LlmClient>, agents: TravelAgents) -> Result<Self> {
        let prompts = PipelinePrompts::load(&config.pipeline)?;
        Self::from_prompts(config, prompts, llm, agents)
    }

    pub fn from_prompts(
        config: &AppConfig,
        prompts: PipelinePrompts,
        llm: Arc<dyn LlmClient>,
        agents: TravelAgents,
    ) -> Result<Self> {
        let max_iterations = config.pipeline.max_iterations;
        let block_on_unparsed = config.pipeline.block_on_unparsed_judgment;

        let mut g = Graph::new(ValueKind::Vars, ValueKind::Message);

        g.add_node(Node::template(
            "feasibility_prompt",
            ValueKind::Vars,
            PromptTemplate::new(prompts.classify_system, CLASSIFY_USER_TEMPLATE),
        ))?;
        g.add_node(Node::generate("feasibility_model", llm.clone(), config.model.clone()))?;
        g.add_node(Node::transform(
            "parse_judgment",
            ValueKind::Message,
            ValueKind::Judgment,
            move |reply| {
                Ok(Value::Judgment(parse_judgment(
                    &reply.to_string(),
                    block_on_unparsed,
                )))
            },
        ))?;

        g.add_node(Node::notice("plan_blocked", ValueKind::Judgment, prompts.blocked_notice))?;
        g.add_node(Node::agent(
            "blocked_advisor",
            agents.feasibility_advisor,
            max_iterations,
        ))?;

        g.add_node(Node::notice("plan_allowed", ValueKind::Judgment, prompts.allowed_notice))?;
        g.add_node(Node::agent(
            "overall_route_planner",
            agents.route_planner.clone(),
            max_iterations,
        ))?;
        g.add_node(
            Node::agent("flight_planner", agents.flight_advisor.clone(), max_iterations)
                .accepting(ValueKind::Message)
                .with_label("flight plan"),
        )?;
        g.add_node(
            Node::agent("attraction_planner", agents.attraction_highlights, max_iterations)
                .accepting(ValueKind::Message)
                .with_label("attraction highlights"),
        )?;
        g.add_node(
            Node::transform("overall_summary", ValueKind::Message, ValueKind::Text, |route| {
                Ok(Value::Text(route.to_string()))
            })
            .with_label("overall route"),
        )?;
        g.add_node(Node::merge("merge_plans"))?;
        g.add_node(Node::template(
            "summary_prompt",
            ValueKind::Vars,
            PromptTemplate::new(prompts.summary_system, SUMMARY_USER_TEMPLATE),
        ))?;
        g.add_node(Node::generate("summary_model", llm, config.model.clone()))?;

        g.add_edge(START, "feasibility_prompt")?;
        g.add_edge("feasibility_prompt", "feasibility_model")?;
        g.add_edge("feasibility_model", "parse_judgment")?;
        g.add_branch(
            "parse_judgment",
            Branch::on_flag("plan_feasibility", "plan_blocked", "plan_allowed"),
        )?;

        g.add_edge("plan_blocked", "blocked_advisor")?;
        g.add_edge("blocked_advisor", END)?;

        g.add_edge("plan_allowed", "overall_route_planner")?;
        for fan_out in ["flight_planner", "attraction_planner", "overall_summary"] {
            g.add_edge("overall_route_planner", fan_out)?;
            g.add_edge(fan_out, "merge_plans")?;
        }
        g.add_edge("merge_plans", "summary_prompt")?;
        g.add_edge("summary_prompt", "summary_model")?;
        g.add_edge("summary_model", END)?;

        let graph = g.compile()?;

        let guide = SequentialChain::new(GUIDE_CHAIN)
            .with_step(agents.route_planner)
            .with_step(agents.flight_advisor)
            .with_step(agents.itinerary_builder);

        Ok(Self {
            graph,
            guide,
            max_iterations,
        })
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Plan a trip and return the final assistant message.
    pub async fn run(&self, description: &str) -> Result<ChatMessage> {
        let result = self.run_traced(description).await?;
        match result.output {
            Value::Message(message) => Ok(message),
            other => Err(SkeinError::ContractViolation {
                node: END.to_string(),
                expected: ValueKind::Message.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    /// Plan a trip, keeping per-node timing.
    pub async fn run_traced(&self, description: &str) -> Result<ExecutionResult> {
        if description.trim().is_empty() {
            return Err(SkeinError::EmptyContent);
        }
        info!(chars = description.len(), "Planning trip");
        self.graph
            .invoke_traced(Value::var("description", description))
            .await
    }

    /// Run the route, flight and itinerary agents one after another.
    pub async fn guide(
        &self,
        description: &str,
        on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<String> {
        if description.trim().is_empty() {
            return Err(SkeinError::EmptyContent);
        }
        aggregate(
            self.guide.run(description.to_string(), self.max_iterations),
            on_chunk,
        )
        .await
    }
}
