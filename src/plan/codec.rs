//! Plan document codec.
//!
//! `parse` maps a (possibly truncated) plan document onto a `Plan`;
//! `serialize` writes the canonical form back out. Serialization is
//! deterministic (stable attribute order, two-space indent, trimmed text),
//! so `serialize(parse(serialize(p)))` equals `serialize(p)`. That stability
//! matters because node ids are re-derived from serialized position.

use tracing::debug;

use crate::compiler;
use crate::error::{Error, Result};

use super::markup::{self, escape_attr, escape_text, Element};
use super::{AgentStatus, Plan, PlanAgent, PlanNode, VIRTUAL_ROOT_ID};

/// Parse a plan document.
///
/// Returns `Ok(None)` while no root element has been produced yet. With
/// `is_final == false` the parser tolerates truncation anywhere; with
/// `is_final == true` a structurally invalid document is an error and a
/// successful parse runs the compiler to set each agent's `parallel` flag.
///
/// `rationale` overrides the document's `<thought>` when the planner streams
/// its reasoning out of band.
pub fn parse(
    plan_id: &str,
    text: &str,
    is_final: bool,
    rationale: Option<&str>,
) -> Result<Option<Plan>> {
    let Some(root) = markup::parse(text, is_final)? else {
        return Ok(None);
    };
    if is_final && root.name != "root" {
        return Err(Error::PlanParse(format!(
            "expected <root> document element, found <{}>",
            root.name
        )));
    }

    let name = root.child("name").map(|e| e.text()).unwrap_or_default();
    let thought = root.child("thought").map(|e| e.text()).unwrap_or_default();

    let mut agents = Vec::new();
    if let Some(agents_el) = root.child("agents") {
        for (ordinal, agent_el) in agents_el.children_named("agent").enumerate() {
            agents.push(parse_agent(plan_id, ordinal, agent_el));
        }
    }

    let mut plan = Plan {
        id: plan_id.to_string(),
        name,
        rationale: rationale.map(str::to_string).unwrap_or(thought),
        agents,
        markup: String::new(),
    };

    if is_final {
        compiler::compile(&mut plan)?;
        debug!(plan = %plan.id, agents = plan.agents.len(), "final plan parse complete");
    }

    plan.markup = serialize(&plan);
    Ok(Some(plan))
}

fn parse_agent(plan_id: &str, ordinal: usize, el: &Element) -> PlanAgent {
    let written_ordinal = el
        .attr("id")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(ordinal);

    let depends_on = el
        .attr("dependsOn")
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|dep| {
            if dep == VIRTUAL_ROOT_ID {
                VIRTUAL_ROOT_ID.to_string()
            } else {
                format!("{plan_id}-{dep}")
            }
        })
        .collect();

    let nodes = el
        .child("nodes")
        .map(parse_nodes)
        .unwrap_or_default();

    let mut agent = PlanAgent {
        id: format!("{plan_id}-{written_ordinal}"),
        provider: el.attr("name").unwrap_or("").to_string(),
        depends_on,
        task: el.child("task").map(|e| e.text()).unwrap_or_default(),
        nodes,
        status: AgentStatus::Init,
        parallel: false,
        markup: String::new(),
        error: None,
    };
    agent.markup = serialize_agent(&agent, written_ordinal, plan_id, 2);
    agent
}

fn parse_nodes(el: &Element) -> Vec<PlanNode> {
    let mut nodes = Vec::new();
    for child in el.children.iter() {
        let markup::Node::Element(e) = child else {
            continue;
        };
        match e.name.as_str() {
            "node" => nodes.push(parse_step(e)),
            "forEach" => nodes.push(PlanNode::ForEach {
                items: e.attr("items").unwrap_or("").to_string(),
                steps: e.children_named("node").map(parse_step).collect(),
            }),
            "watch" => nodes.push(PlanNode::Watch {
                event: e.attr("event").unwrap_or("").to_string(),
                looping: e.attr("loop") == Some("true"),
                description: e.child("description").map(|d| d.text()).unwrap_or_default(),
                triggers: e
                    .child("trigger")
                    .map(|t| t.children_named("node").map(parse_step).collect())
                    .unwrap_or_default(),
            }),
            other => debug!(element = other, "ignoring unknown plan node element"),
        }
    }
    nodes
}

fn parse_step(el: &Element) -> PlanNode {
    PlanNode::Step {
        text: el.text(),
        input: el.attr("input").map(str::to_string),
        output: el.attr("output").map(str::to_string),
    }
}

/// Serialize the plan to its canonical markup.
pub fn serialize(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str("<root>\n");
    out.push_str(&format!("  <name>{}</name>\n", escape_text(plan.name.trim())));
    out.push_str(&format!(
        "  <thought>{}</thought>\n",
        escape_text(plan.rationale.trim())
    ));
    out.push_str("  <agents>\n");
    for (ordinal, agent) in plan.agents.iter().enumerate() {
        out.push_str(&serialize_agent(agent, ordinal, &plan.id, 4));
    }
    out.push_str("  </agents>\n");
    out.push_str("</root>\n");
    out
}

fn serialize_agent(agent: &PlanAgent, ordinal: usize, plan_id: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    let deps: Vec<String> = agent
        .depends_on
        .iter()
        .map(|dep| dependency_ordinal(dep, plan_id))
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        "{pad}<agent name=\"{}\" id=\"{ordinal}\" dependsOn=\"{}\">\n",
        escape_attr(&agent.provider),
        escape_attr(&deps.join(","))
    ));
    out.push_str(&format!(
        "{pad}  <task>{}</task>\n",
        escape_text(agent.task.trim())
    ));
    out.push_str(&format!("{pad}  <nodes>\n"));
    for node in &agent.nodes {
        serialize_node(&mut out, node, indent + 4);
    }
    out.push_str(&format!("{pad}  </nodes>\n"));
    out.push_str(&format!("{pad}</agent>\n"));
    out
}

/// Map a stored dependency id back to the ordinal written in the markup.
fn dependency_ordinal(dep: &str, plan_id: &str) -> String {
    if dep == VIRTUAL_ROOT_ID {
        return dep.to_string();
    }
    dep.strip_prefix(plan_id)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(dep)
        .to_string()
}

fn serialize_node(out: &mut String, node: &PlanNode, indent: usize) {
    let pad = " ".repeat(indent);
    match node {
        PlanNode::Step { text, input, output } => {
            out.push_str(&pad);
            out.push_str("<node");
            if let Some(input) = input {
                out.push_str(&format!(" input=\"{}\"", escape_attr(input)));
            }
            if let Some(output) = output {
                out.push_str(&format!(" output=\"{}\"", escape_attr(output)));
            }
            out.push_str(&format!(">{}</node>\n", escape_text(text.trim())));
        }
        PlanNode::ForEach { items, steps } => {
            out.push_str(&format!("{pad}<forEach items=\"{}\">\n", escape_attr(items)));
            for step in steps {
                serialize_node(out, step, indent + 2);
            }
            out.push_str(&format!("{pad}</forEach>\n"));
        }
        PlanNode::Watch {
            event,
            looping,
            description,
            triggers,
        } => {
            out.push_str(&format!(
                "{pad}<watch event=\"{}\" loop=\"{looping}\">\n",
                escape_attr(event)
            ));
            out.push_str(&format!(
                "{pad}  <description>{}</description>\n",
                escape_text(description.trim())
            ));
            out.push_str(&format!("{pad}  <trigger>\n"));
            for step in triggers {
                serialize_node(out, step, indent + 4);
            }
            out.push_str(&format!("{pad}  </trigger>\n"));
            out.push_str(&format!("{pad}</watch>\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NodeId;

    const DOC: &str = r#"<root>
  <name>Collect prices</name>
  <thought>Split fetch and summarize.</thought>
  <agents>
    <agent name="Browser" id="0" dependsOn="">
      <task>Fetch the product pages</task>
      <nodes>
        <node output="pages">Open each product page</node>
        <forEach items="pages">
          <node input="pages" output="prices">Extract the listed price</node>
        </forEach>
        <watch event="dom" loop="true">
          <description>Re-extract when the price block changes</description>
          <trigger>
            <node>Record the new price</node>
          </trigger>
        </watch>
      </nodes>
    </agent>
    <agent name="File" id="1" dependsOn="0">
      <task>Write the summary</task>
      <nodes>
        <node input="prices">Save prices to summary.csv</node>
      </nodes>
    </agent>
  </agents>
</root>
"#;

    #[test]
    fn parses_full_document() {
        let plan = parse("t1", DOC, true, None).unwrap().unwrap();
        assert_eq!(plan.name, "Collect prices");
        assert_eq!(plan.rationale, "Split fetch and summarize.");
        assert_eq!(plan.agents.len(), 2);

        let browser = &plan.agents[0];
        assert_eq!(browser.id, "t1-0");
        assert_eq!(browser.provider, "Browser");
        assert!(browser.depends_on.is_empty());
        assert_eq!(browser.nodes.len(), 3);
        assert!(matches!(
            &browser.nodes[1],
            PlanNode::ForEach { items, steps } if items == "pages" && steps.len() == 1
        ));
        assert!(matches!(
            &browser.nodes[2],
            PlanNode::Watch { event, looping: true, triggers, .. }
                if event == "dom" && triggers.len() == 1
        ));

        let file = &plan.agents[1];
        assert_eq!(file.depends_on, vec!["t1-0".to_string()]);
    }

    #[test]
    fn round_trip_is_stable() {
        let plan = parse("t1", DOC, true, None).unwrap().unwrap();
        let once = serialize(&plan);
        let reparsed = parse("t1", &once, true, None).unwrap().unwrap();
        assert_eq!(serialize(&reparsed), once);
        assert_eq!(reparsed.agents.len(), plan.agents.len());
        assert_eq!(reparsed.agents[1].depends_on, plan.agents[1].depends_on);
        assert_eq!(reparsed.agents[0].nodes, plan.agents[0].nodes);
    }

    #[test]
    fn partial_prefixes_never_error() {
        for end in 0..=DOC.len() {
            if !DOC.is_char_boundary(end) {
                continue;
            }
            let parsed = parse("t1", &DOC[..end], false, None).unwrap();
            if let Some(plan) = parsed {
                // Whatever came through must be addressable.
                for (a, agent) in plan.agents.iter().enumerate() {
                    for n in 0..agent.nodes.len() {
                        plan.node(NodeId { agent: a, node: n }).unwrap();
                    }
                }
            }
        }
    }

    #[test]
    fn rationale_override_wins() {
        let plan = parse("t1", DOC, true, Some("external reasoning"))
            .unwrap()
            .unwrap();
        assert_eq!(plan.rationale, "external reasoning");
    }

    #[test]
    fn final_parse_sets_parallel_flags() {
        let doc = r#"<root><name>n</name><thought>t</thought><agents>
            <agent name="A" id="0" dependsOn=""><task>a</task><nodes></nodes></agent>
            <agent name="B" id="1" dependsOn="0"><task>b</task><nodes></nodes></agent>
            <agent name="C" id="2" dependsOn="0"><task>c</task><nodes></nodes></agent>
        </agents></root>"#;
        let plan = parse("t1", doc, true, None).unwrap().unwrap();
        assert!(!plan.agents[0].parallel);
        assert!(plan.agents[1].parallel);
        assert!(plan.agents[2].parallel);
    }

    #[test]
    fn final_parse_without_agents_is_fatal() {
        let doc = "<root><name>n</name><thought>t</thought><agents></agents></root>";
        assert!(matches!(
            parse("t1", doc, true, None),
            Err(Error::NoExecutableAgent)
        ));
    }

    #[test]
    fn missing_root_returns_none() {
        assert!(parse("t1", "no markup here", false, None).unwrap().is_none());
    }
}
