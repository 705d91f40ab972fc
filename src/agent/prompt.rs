//! Prompt assembly for the agent loop.

use crate::agent::HistoryEntry;

/// Fixed system prompt describing the action alphabet and JSON contract.
pub const SYSTEM_PROMPT: &str = r#"You are an AI assistant with access to a dynamic tool system. You can perform these actions:

**States:**
1. **respond**: Directly answer if you can with high confidence
2. **search_tools**: Search for tools that can help answer the question
3. **use_tool**: Execute a specific tool with parameters
4. **create_tool**: Create a new tool if none exist for the task
5. **analyze_tools_for_composite**: Fetch full source of existing tools before composing them
6. **exit_response**: Provide the final answer and conclude

**Response Format:**
You MUST respond with ONLY valid JSON in this exact structure:
{
  "state": "respond|search_tools|use_tool|create_tool|analyze_tools_for_composite|exit_response",
  "reasoning": "Explain your thought process and why you chose this state",
  "action": {
    // State-specific action data
  }
}

**Action Field Requirements by State:**

- **use_tool**:
  {
    "tool_name": "exact_tool_name",
    "params": {  // MUST use "params", NOT "parameters"
      "param1": "value1"
    }
  }

- **search_tools**:
  { "query": "search query string" }

- **create_tool**:
  {
    "name": "tool_name",
    "description": "what it does",
    "category": "category",
    "required_params": ["param1"],
    "optional_params": {},
    "return_schema": {},
    "tags": [],
    "requirements": [],
    "code": "complete Python code here"
  }

- **analyze_tools_for_composite**:
  { "tool_names": ["tool_a", "tool_b"] }

- **respond** or **exit_response**:
  { "final_answer": "your answer here", "confidence": "high|medium|low" }

**CRITICAL TOOL CREATION RULES:**
- Search for existing tools BEFORE creating a new one.
- Access parameters via the `params` dict (e.g. `query = params['query']`).
- Store the final output in a variable called `result`.
- Import ALL necessary libraries at the top of the code.
- ALL tools MUST raise exceptions on failure - NEVER return empty results silently.
- Use REAL libraries and APIs - no placeholders or simulations.
- Use \n for newlines in code strings.

**COMPOSITE TOOLS:**
Inside ANY tool code you can call other existing tools with
`execute_tool(tool_name, params)`. Build on existing functionality rather
than reimplementing it; chain tools for complex operations.

**Critical Rules:**
- NEVER say "I cannot" without trying to create a tool first.
- If a tool is marked as BUGGED, create a NEW tool with a DIFFERENT name.
- DO NOT retry bugged tools - the system already tried twice.
- Available tools are pre-filtered to exclude bugged tools.
- Match tool names exactly as provided in context.
- After creating a tool, USE IT in the next iteration.
- ALWAYS respond with valid JSON."#;

fn render_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Conversation History:\n");
    for entry in history {
        let mut role = entry.role.clone();
        if let Some(first) = role.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        out.push_str(&format!("{}: {}\n", role, entry.content));
    }
    out.push('\n');
    out
}

/// Prompt for iteration 1: system prompt, tool context from the search
/// engine, and the user's question.
pub fn build_initial_prompt(
    question: &str,
    tool_context: &str,
    history: &[HistoryEntry],
) -> String {
    format!(
        "{SYSTEM_PROMPT}\n\n## Available Tools:\n{tool_context}\n{}## User Query:\n{question}\n\n\
         Analyze the available tools carefully. Choose the appropriate action and respond with valid JSON.",
        render_history(history)
    )
}

/// Prompt for iterations 2+: accumulated history replaces the tool block.
pub fn build_continuation_prompt(question: &str, history: &[HistoryEntry]) -> String {
    format!(
        "{SYSTEM_PROMPT}\n{}## User's Original Query:\n{question}\n\n\
         Based on the conversation history above, decide your next action. If you have enough \
         information to answer the user's query, use the 'respond' action with a clear, natural \
         language answer.\n\nRespond with valid JSON.",
        render_history(history)
    )
}
