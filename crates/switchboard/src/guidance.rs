//! Text returned to the caller in place of errors. Every message tells the
//! model how to get back on track with another call.

use indoc::{formatdoc, indoc};

pub fn instructions() -> String {
    indoc! {r#"
        This server/tool provides real-time, programmatic access to all Azure products, services, and resources, as well as all interactions with the Azure Developer CLI (azd).
        Use this tool for any Azure control plane or data plane operation, including resource management and automation.
        To discover available capabilities, call the tool with the "learn" parameter to get a list of top-level tools.
        To explore further, set "learn" and specify a tool name to retrieve supported commands and their parameters.
        To execute an action, set the "tool", "command", and convert the users intent into the "parameters" based on the discovered schema.
        Always use this tool for any Azure or "azd" related operation requiring up-to-date, dynamic, and interactive capabilities.
    "#}
    .to_string()
}

pub fn tool_description() -> String {
    instructions()
}

pub fn provider_not_found(provider: &str) -> String {
    formatdoc! {r#"
        Tool {provider} not found
        Run again with the "learn" argument and empty "tool" to get a list of available tools and their parameters.
    "#}
}

pub fn underspecified() -> String {
    indoc! {r#"
        The "tool" and "command" parameters are required when not learning
        Run again with the "learn" argument to get a list of available tools and their parameters.
        To learn about a specific tool, use the "tool" argument with the name of the tool.
    "#}
    .to_string()
}

pub fn learn_with_command() -> String {
    indoc! {r#"
        The "learn" argument cannot be combined with a "command".
        Run again with "learn" and a "tool" to list that tool's commands, or with "tool" and "command" to run one of them.
    "#}
    .to_string()
}

pub fn invalid_arguments(error: &str) -> String {
    formatdoc! {r#"
        The arguments could not be read: {error}
        Expected "intent" (string), "tool" (string), "command" (string), "parameters" (object) and "learn" (boolean).
    "#}
}

pub fn root_listing(listing: &str) -> String {
    formatdoc! {r#"
        Here are the available tools.
        Run again with the "learn" argument and a "tool" name to list that tool's commands and their parameters.

        {listing}
    "#}
}

pub fn provider_capabilities(provider: &str, capabilities: &str) -> String {
    formatdoc! {r#"
        Here are the available command and their parameters for '{provider}' tool.
        If you do not find a suitable tool, run again with the "learn" argument and empty "tool" to get a list of available tools and their parameters.
        Next, identify the command you want to execute and run again with the "tool", "command", and "parameters" arguments.

        {capabilities}
    "#}
}

pub fn establishment_failed(provider: &str, error: &str) -> String {
    formatdoc! {r#"
        Failed to start tool client: {error}
        The '{provider}' tool could not be started. Run again with the "learn" argument and empty "tool" to choose another tool.
    "#}
}

pub fn learn_failed(provider: &str, error: &str) -> String {
    formatdoc! {r#"
        Failed to list the commands of tool '{provider}': {error}
        Run again with the "learn" argument and empty "tool" to get a list of available tools.
    "#}
}

pub fn stale_client(provider: &str, error: &str) -> String {
    formatdoc! {r#"
        The connection to tool '{provider}' was lost: {error}
        The tool will be restarted on the next call. Run the same request again.
    "#}
}

pub fn invocation_failed(provider: &str, command: &str, error: &str) -> String {
    formatdoc! {r#"
        There was an error finding or calling tool and command.
        Failed to call tool: {provider}, command: {command}, Error: {error}

        Run again with the "learn" argument and the "tool" name to get a list of available tools and their parameters.
    "#}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_the_provider() {
        let text = provider_not_found("cosmos");
        assert!(text.starts_with("Tool cosmos not found\n"));
        assert!(text.contains(r#""learn""#));
    }

    #[test]
    fn test_invocation_failure_names_provider_command_and_cause() {
        let text = invocation_failed("storage", "list-containers", "connection reset");
        assert!(text.contains("Failed to call tool: storage, command: list-containers, Error: connection reset"));
    }

    #[test]
    fn test_texts_are_dedented() {
        for text in [underspecified(), instructions(), establishment_failed("a", "b")] {
            assert!(!text.starts_with(' '), "{text}");
        }
    }
}
