//! Generation of the Python driver script executed inside the sandbox.
//!
//! The driver owns the wire contract: params go in as a JSON literal, the
//! outcome comes out as a single JSON line — `{"success": true, "result": …}`
//! on stdout with exit 0, or `{"success": false, "error", "traceback"}` on
//! stderr with exit 1. Composite tools get an `execute_tool(name, params)`
//! callable whose dispatch table is inlined at render time, so the sandbox
//! needs no callback channel to the host.

use super::{DriverMode, ExecutionRequest};
use std::fmt::Write as _;

/// Encode a Rust string as a Python string literal. JSON string escaping is
/// a subset of Python's, so `serde_json` does the heavy lifting.
fn py_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Render the complete driver script for a request.
pub fn render_driver(req: &ExecutionRequest) -> String {
    let mut script = String::new();

    script.push_str(
        "import sys\nimport json\nimport traceback\n\n\
         def tool(name=None, category=\"general\", auth_required=False, rate_limit=None, tags=None, requirements=None):\n\
         \x20   def decorator(func):\n\
         \x20       func._is_tool = True\n\
         \x20       return func\n\
         \x20   return decorator\n\n",
    );

    // Dispatch table for execute_tool(): callee sources resolved by the
    // store before launch.
    script.push_str("TOOL_SOURCES = {\n");
    for (name, source) in &req.injected_tools {
        let _ = writeln!(script, "    {}: {},", py_str(name), py_str(source));
    }
    script.push_str("}\n\n");

    script.push_str(
        "def execute_tool(name, params):\n\
         \x20   if name not in TOOL_SOURCES:\n\
         \x20       raise ValueError(\"Tool '%s' is not available in this sandbox\" % name)\n\
         \x20   ns = {\"params\": params, \"execute_tool\": execute_tool, \"tool\": tool}\n\
         \x20   exec(compile(TOOL_SOURCES[name], name, \"exec\"), ns)\n\
         \x20   if \"result\" not in ns:\n\
         \x20       raise RuntimeError(\"Tool '%s' did not assign 'result'\" % name)\n\
         \x20   return ns[\"result\"]\n\n",
    );

    let params_json = serde_json::to_string(&req.params).unwrap_or_else(|_| "{}".to_string());

    match &req.mode {
        DriverMode::Function { entry } => {
            // Tool source spliced verbatim; the entrypoint is called with
            // params expanded as keyword arguments.
            script.push_str(&req.code);
            script.push_str("\n\n");
            let _ = writeln!(
                script,
                "def __toolforge_main():\n    params = json.loads({})\n    return {}(**params)\n",
                py_str(&params_json),
                entry
            );
        }
        DriverMode::Script => {
            // Tool code reads `params` and assigns `result`.
            let _ = writeln!(
                script,
                "__TOOLFORGE_CODE = {}\n\n\
                 def __toolforge_main():\n\
                 \x20   params = json.loads({})\n\
                 \x20   ns = {{\"params\": params, \"execute_tool\": execute_tool, \"tool\": tool}}\n\
                 \x20   exec(compile(__TOOLFORGE_CODE, {}, \"exec\"), ns)\n\
                 \x20   if \"result\" not in ns:\n\
                 \x20       raise RuntimeError(\"tool code did not assign 'result'\")\n\
                 \x20   return ns[\"result\"]\n",
                py_str(&req.code),
                py_str(&params_json),
                py_str(&req.tool_name),
            );
        }
    }

    script.push_str(
        "\ntry:\n\
         \x20   output = __toolforge_main()\n\
         \x20   if not isinstance(output, (dict, list)):\n\
         \x20       output = {\"result\": output}\n\
         \x20   print(json.dumps({\"success\": True, \"result\": output}, default=str))\n\
         \x20   sys.exit(0)\n\
         except Exception as exc:\n\
         \x20   print(json.dumps({\"success\": False, \"error\": str(exc),\n\
         \x20                     \"traceback\": traceback.format_exc()}, default=str),\n\
         \x20         file=sys.stderr)\n\
         \x20   sys.exit(1)\n",
    );

    script
}
