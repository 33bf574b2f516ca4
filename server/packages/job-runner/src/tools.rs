//! Allow-listed tools and the mapping from caller parameters to a script invocation.
//!
//! Every tool is a plain function from [`ToolParams`] to [`ToolInput`]; adding a
//! tool means adding a row to [`ToolCatalog::builtin`], never a new branch in
//! the launcher.

use std::collections::BTreeMap;

use toolbox_error::ToolboxError;

pub type ToolParams = BTreeMap<String, String>;

pub type BuildInput = fn(&str, &ToolParams) -> Result<ToolInput, ToolboxError>;

/// What a tool's script receives: extra command-line arguments and an
/// optional payload for its standard input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolInput {
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl ToolInput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn args(args: Vec<String>) -> Self {
        Self { args, stdin: None }
    }

    /// One answer per prompt, newline terminated.
    pub fn prompts<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = answers.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return Self::none();
        }
        let mut payload = lines.join("\n");
        payload.push('\n');
        Self {
            args: Vec::new(),
            stdin: Some(payload),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    /// Script path relative to the scripts root.
    pub script: String,
    pub description: String,
    pub build: BuildInput,
}

impl ToolSpec {
    pub fn new(name: &str, script: &str, description: &str, build: BuildInput) -> Self {
        Self {
            name: name.to_string(),
            script: script.to_string(),
            description: description.to_string(),
            build,
        }
    }

    pub fn build_input(&self, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
        (self.build)(&self.name, params)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with_tool(ToolSpec::new(
                "build_folder",
                "Claude/Build_folder.py",
                "Create numbered sub-folders 1..count under a base folder",
                build_folder,
            ))
            .with_tool(ToolSpec::new(
                "rename_files",
                "Claude/Rename_files.py",
                "Rename files in a folder with random names",
                path_only,
            ))
            .with_tool(ToolSpec::new(
                "webp_video",
                "Claude/Webp_video_to_img.py",
                "Convert videos to animated WebP through ffmpeg",
                webp_video,
            ))
            .with_tool(ToolSpec::new(
                "copy_files",
                "Claude/Copy_files.py",
                "Distribute random files from a source folder into target folders",
                copy_files,
            ))
            .with_tool(ToolSpec::new(
                "unzip",
                "Claude/Unzip.py",
                "Extract every ZIP archive found under a folder",
                unzip,
            ))
            .with_tool(ToolSpec::new(
                "md5_renew",
                "Claude/Md5_renew.py",
                "Append random bytes to files so their MD5 changes",
                md5_renew,
            ))
            .with_tool(ToolSpec::new(
                "auto_build_copy",
                "Claude/Auto_build_and_copy.py",
                "Create numbered folders and fill them from a source folder",
                auto_build_copy,
            ))
            .with_tool(ToolSpec::new(
                "webp_resize",
                "Claude/Webp_resize.py",
                "Shrink WebP animations above a size threshold",
                webp_resize,
            ))
            .with_tool(ToolSpec::new(
                "excel_renew",
                "Claude/Excel_renew.py",
                "Clear generated cells in Excel workbooks",
                path_only,
            ))
            .with_tool(ToolSpec::new(
                "test_stop_button",
                "Claude/Test_stop_button.py",
                "Long-running job for exercising the stop button",
                no_input,
            ))
    }

    pub fn with_tool(mut self, spec: ToolSpec) -> Self {
        self.tools.insert(spec.name.clone(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn required(tool: &str, params: &ToolParams, key: &str) -> Result<String, ToolboxError> {
    match params.get(key).map(|value| value.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ToolboxError::MissingParameter {
            tool: tool.to_string(),
            parameter: key.to_string(),
        }),
    }
}

fn optional(params: &ToolParams, key: &str, default: &str) -> String {
    match params.get(key).map(|value| value.trim()) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => default.to_string(),
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "y" | "yes" | "1" | "on" | "replace_all"
    )
}

fn flag(params: &ToolParams, key: &str) -> bool {
    params.get(key).map(|value| is_truthy(value)).unwrap_or(false)
}

fn no_input(_tool: &str, _params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::none())
}

fn path_only(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([required(tool, params, "path")?]))
}

fn build_folder(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([
        required(tool, params, "path")?,
        optional(params, "count", "5"),
    ]))
}

fn webp_video(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    let overwrite = if flag(params, "overwrite") {
        "replace_all"
    } else {
        "skip"
    };
    Ok(ToolInput::args(vec![
        required(tool, params, "path")?,
        "--overwrite".to_string(),
        overwrite.to_string(),
        "--duration".to_string(),
        optional(params, "duration", "3"),
    ]))
}

fn copy_files(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([
        required(tool, params, "source_path")?,
        required(tool, params, "target_path")?,
    ]))
}

fn unzip(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    let overwrite = if flag(params, "overwrite") { "y" } else { "n" };
    Ok(ToolInput::prompts([
        required(tool, params, "path")?,
        overwrite.to_string(),
    ]))
}

fn md5_renew(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([
        required(tool, params, "path")?,
        optional(params, "bytes", "10"),
    ]))
}

fn auto_build_copy(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([
        required(tool, params, "base_path")?,
        optional(params, "count", "5"),
        required(tool, params, "source_path")?,
    ]))
}

fn webp_resize(tool: &str, params: &ToolParams) -> Result<ToolInput, ToolboxError> {
    Ok(ToolInput::prompts([
        required(tool, params, "path")?,
        optional(params, "size_threshold", "10"),
        optional(params, "fps", "15"),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ToolParams {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn build(tool: &str, pairs: &[(&str, &str)]) -> Result<ToolInput, ToolboxError> {
        let catalog = ToolCatalog::builtin();
        catalog
            .get(tool)
            .expect("builtin tool")
            .build_input(&params(pairs))
    }

    #[test]
    fn builtin_catalog_lists_every_tool() {
        let names = ToolCatalog::builtin().names();
        assert_eq!(
            names,
            vec![
                "auto_build_copy",
                "build_folder",
                "copy_files",
                "excel_renew",
                "md5_renew",
                "rename_files",
                "test_stop_button",
                "unzip",
                "webp_resize",
                "webp_video",
            ]
        );
    }

    #[test]
    fn build_folder_answers_prompts_with_default_count() {
        let input = build("build_folder", &[("path", "/tmp/x")]).expect("input");
        assert!(input.args.is_empty());
        assert_eq!(input.stdin.as_deref(), Some("/tmp/x\n5\n"));

        let input = build("build_folder", &[("path", "/tmp/x"), ("count", "3")]).expect("input");
        assert_eq!(input.stdin.as_deref(), Some("/tmp/x\n3\n"));
    }

    #[test]
    fn webp_video_uses_flags_instead_of_stdin() {
        let input = build(
            "webp_video",
            &[("path", "/videos"), ("overwrite", "Yes"), ("duration", "5")],
        )
        .expect("input");
        assert_eq!(input.stdin, None);
        assert_eq!(
            input.args,
            vec!["/videos", "--overwrite", "replace_all", "--duration", "5"]
        );

        let input = build("webp_video", &[("path", "/videos"), ("overwrite", "false")])
            .expect("input");
        assert_eq!(
            input.args,
            vec!["/videos", "--overwrite", "skip", "--duration", "3"]
        );
    }

    #[test]
    fn unzip_maps_overwrite_to_yes_no_answer() {
        let input = build("unzip", &[("path", "/zips"), ("overwrite", "on")]).expect("input");
        assert_eq!(input.stdin.as_deref(), Some("/zips\ny\n"));

        let input = build("unzip", &[("path", "/zips"), ("overwrite", "false")]).expect("input");
        assert_eq!(input.stdin.as_deref(), Some("/zips\nn\n"));
    }

    #[test]
    fn missing_or_blank_required_parameter_is_rejected() {
        let err = build("copy_files", &[("source_path", "/a")]).unwrap_err();
        match err {
            ToolboxError::MissingParameter { tool, parameter } => {
                assert_eq!(tool, "copy_files");
                assert_eq!(parameter, "target_path");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = build("excel_renew", &[("path", "   ")]).unwrap_err();
        assert!(matches!(err, ToolboxError::MissingParameter { .. }));
    }

    #[test]
    fn stop_button_tool_takes_no_input() {
        let input = build("test_stop_button", &[("ignored", "1")]).expect("input");
        assert_eq!(input, ToolInput::none());
    }

    #[test]
    fn webp_resize_fills_defaults_in_prompt_order() {
        let input = build("webp_resize", &[("path", "/webp"), ("fps", "24")]).expect("input");
        assert_eq!(input.stdin.as_deref(), Some("/webp\n10\n24\n"));
    }
}
