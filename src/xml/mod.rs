//! Core-owned XML wire formats.
//!
//! Two documents cross this boundary: the `<Action>` envelope produced by
//! the reasoner and the `<ExecutionResult>` document offered to consumers
//! that want a structured rendering of a step outcome. Parsing is
//! deliberately permissive (model output is extracted with recovery and
//! a warning rather than rejected outright) while everything this module
//! writes is well-formed by construction.

use std::io::Cursor;

use once_cell::sync::Lazy;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use regex::Regex;

use crate::errors::AgentError;
use crate::executor::ExecutionResult;

static ACTION_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Action>.*?</Action>").expect("static regex"));
static THOUGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Thought>(.*?)</Thought>").expect("static regex"));
static CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Code>(.*?)</Code>").expect("static regex"));
// CDATA form matched first: the escaped body cannot contain "]]>", so the
// first terminator is authoritative even when the code mentions </Code>.
static CODE_CDATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<Code>\s*<!\[CDATA\[(.*?)\]\]>\s*</Code>").expect("static regex")
});

/// Maximum characters of a variable value carried in the XML document.
const MAX_VARIABLE_CHARS: usize = 5000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Strict well-formedness check.
pub fn validate_xml(xml: &str) -> bool {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => return true,
            Ok(_) => {}
            Err(e) => {
                log::error!("XML validation failed: {e}");
                return false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Action parsing
// ---------------------------------------------------------------------------

/// Parse an `<Action>` response into `(thought, code)`.
///
/// The `<Action>` block is located anywhere in the response; surrounding
/// prose is ignored. Recoverable syntax problems inside the block are
/// logged as warnings and extraction still proceeds. A missing block is a
/// hard parsing error.
pub fn parse_action_response(response: &str) -> Result<(String, String), AgentError> {
    let block = ACTION_BLOCK
        .find(response)
        .ok_or_else(|| AgentError::Parsing("No <Action> tag found in response".into()))?
        .as_str();

    if !validate_xml(block) {
        log::warn!("Recovering from malformed XML in action response");
    }

    let thought = THOUGHT_RE
        .captures(block)
        .map(|c| unwrap_text(&c[1]))
        .unwrap_or_default();
    let code = match CODE_CDATA_RE.captures(block) {
        Some(cdata) => cdata[1].replace("]]]]><![CDATA[>", "]]>"),
        None => CODE_RE
            .captures(block)
            .map(|c| unwrap_text(&c[1]))
            .unwrap_or_default(),
    };
    Ok((thought.trim().to_string(), code.trim().to_string()))
}

/// Unwrap a CDATA section (undoing terminator splitting) if present,
/// otherwise unescape entities.
fn unwrap_text(inner: &str) -> String {
    let trimmed = inner.trim();
    if let Some(body) = trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
    {
        return body.replace("]]]]><![CDATA[>", "]]>");
    }
    unescape(inner)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| inner.to_string())
}

/// Split CDATA terminators so arbitrary text can live inside a CDATA
/// section.
pub fn cdata_escape(text: &str) -> String {
    text.replace("]]>", "]]]]><![CDATA[>")
}

// ---------------------------------------------------------------------------
// Writing helpers
// ---------------------------------------------------------------------------

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn write_error<E: std::fmt::Display>(e: E) -> AgentError {
    AgentError::Internal(format!("XML write error: {e}"))
}

fn start(writer: &mut XmlWriter, tag: &str) -> Result<(), AgentError> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(write_error)
}

fn end(writer: &mut XmlWriter, tag: &str) -> Result<(), AgentError> {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(write_error)
}

fn text_element(writer: &mut XmlWriter, tag: &str, text: &str) -> Result<(), AgentError> {
    start(writer, tag)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(write_error)?;
    end(writer, tag)
}

fn cdata_element(writer: &mut XmlWriter, tag: &str, text: &str) -> Result<(), AgentError> {
    start(writer, tag)?;
    writer
        .write_event(Event::CData(BytesCData::new(cdata_escape(text))))
        .map_err(write_error)?;
    end(writer, tag)
}

fn finish(writer: XmlWriter) -> Result<String, AgentError> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| AgentError::Internal(format!("non-UTF8 XML output: {e}")))
}

// ---------------------------------------------------------------------------
// ExecutionResult document
// ---------------------------------------------------------------------------

/// Render an [`ExecutionResult`] as its XML wire document.
pub fn format_execution_result(result: &ExecutionResult) -> Result<String, AgentError> {
    let completed = result.is_success() && result.task_status.as_deref() == Some("completed");
    let value = if result.is_success() {
        result.result.clone().unwrap_or_default()
    } else {
        result.error.clone().unwrap_or_default()
    };

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    start(&mut writer, "ExecutionResult")?;
    text_element(
        &mut writer,
        "Status",
        if result.is_success() { "Success" } else { "Error" },
    )?;
    cdata_element(&mut writer, "Value", &value)?;
    text_element(
        &mut writer,
        "ExecutionTime",
        &format!("{:.2} seconds", result.execution_time),
    )?;
    text_element(&mut writer, "Completed", if completed { "true" } else { "false" })?;
    if completed {
        cdata_element(&mut writer, "FinalAnswer", &value)?;
    } else if let Some(next_step) = result.next_step.as_deref().filter(|s| !s.is_empty()) {
        cdata_element(&mut writer, "NextStepDescription", next_step)?;
    }
    if !result.local_variables.is_empty() {
        start(&mut writer, "Variables")?;
        for (name, value) in &result.local_variables {
            let mut rendered: String = value.chars().take(MAX_VARIABLE_CHARS).collect();
            if value.chars().count() > MAX_VARIABLE_CHARS {
                rendered.push_str("... (truncated)");
            }
            let mut element = BytesStart::new("Variable");
            element.push_attribute(("name", name.as_str()));
            writer
                .write_event(Event::Start(element))
                .map_err(write_error)?;
            writer
                .write_event(Event::CData(BytesCData::new(cdata_escape(&rendered))))
                .map_err(write_error)?;
            end(&mut writer, "Variable")?;
        }
        end(&mut writer, "Variables")?;
    }
    end(&mut writer, "ExecutionResult")?;

    let xml = finish(writer)?;
    debug_assert!(validate_xml(&xml));
    Ok(xml)
}

/// Extract the text content of the first `<{tag}>` element.
fn find_element_text(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag}[^>]*>(.*?)</{tag}>");
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml).map(|c| unwrap_text(&c[1]))
}

/// Format an `<ExecutionResult>` document into a readable bullet summary.
///
/// Resilient to malformed input: anything that is not an ExecutionResult
/// document is returned raw with a note.
pub fn format_result_summary(result_xml: &str) -> String {
    if !result_xml.contains("<ExecutionResult>") {
        return format!("Raw Result (no ExecutionResult document):\n{result_xml}");
    }
    let field = |tag: &str| find_element_text(result_xml, tag).unwrap_or_else(|| "N/A".into());

    let mut lines = vec![
        format!("- Status: {}", field("Status")),
        format!("- Value: {}", field("Value")),
        format!("- Execution Time: {}", field("ExecutionTime")),
        format!("- Completed: {}", field("Completed")),
    ];
    if let Some(final_answer) = find_element_text(result_xml, "FinalAnswer") {
        lines.push(format!("- Final Answer: {final_answer}"));
    }
    if let Some(next_step) = find_element_text(result_xml, "NextStepDescription") {
        lines.push(format!("- Next Step Description: {next_step}"));
    }
    lines.join("\n")
}

/// Extract `<Value>` from a result document.
pub fn extract_result_value(result_xml: &str) -> String {
    find_element_text(result_xml, "Value").unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Error Action
// ---------------------------------------------------------------------------

/// Build a well-formed error `<Action>` whose program prints a failure
/// marker; returned by the reasoner after its retry budget is spent.
pub fn format_error_result(error_msg: &str) -> String {
    let code = "\nasync def main():\n    print(\"Error: Action generation failed\")\n    return {\"status\": \"inprogress\", \"result\": \"Error: Action generation failed\"}\n";

    let build = || -> Result<String, AgentError> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        start(&mut writer, "Action")?;
        text_element(
            &mut writer,
            "Thought",
            &format!("Failed to generate valid action: {error_msg}"),
        )?;
        start(&mut writer, "Error")?;
        text_element(&mut writer, "Message", error_msg)?;
        end(&mut writer, "Error")?;
        cdata_element(&mut writer, "Code", code)?;
        end(&mut writer, "Action")?;
        finish(writer)
    };
    match build() {
        Ok(xml) => xml,
        Err(e) => {
            log::error!("Failed to build error Action: {e}");
            String::new()
        }
    }
}
