use std::collections::BTreeMap;
use std::path::Path;

use agent_overseer::collaborators::{
    Collaborators, Deployer, HealthCheck, PromptRenderer, TemplateRenderer, Unconfigured,
};
use agent_overseer::AppError;

fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn placeholders_are_substituted() {
    let renderer = TemplateRenderer::new().with_template("review", "Review {{file}} for {{focus}}");
    let text = renderer
        .render("review", &vars(&[("file", "main.rs"), ("focus", "panics")]))
        .expect("render");
    assert_eq!(text, "Review main.rs for panics");
}

#[test]
fn unknown_placeholders_are_left_alone() {
    let renderer = TemplateRenderer::new().with_template("t", "Hi {{name}}, see {{link}}");
    let text = renderer.render("t", &vars(&[("name", "Ada")])).expect("render");
    assert_eq!(text, "Hi Ada, see {{link}}");
}

#[test]
fn templates_load_from_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("summary.md"), "Summarize {{repo}}").expect("write");
    let renderer = TemplateRenderer::new().with_dir(dir.path().to_path_buf());

    let text = renderer
        .render("summary", &vars(&[("repo", "overseer")]))
        .expect("render");
    assert_eq!(text, "Summarize overseer");
}

#[test]
fn in_memory_templates_take_precedence() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("greet.md"), "from disk").expect("write");
    let renderer = TemplateRenderer::new()
        .with_dir(dir.path().to_path_buf())
        .with_template("greet", "from memory");
    assert_eq!(
        renderer.render("greet", &BTreeMap::new()).expect("render"),
        "from memory"
    );
}

#[test]
fn missing_or_unsafe_template_ids_are_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let renderer = TemplateRenderer::new().with_dir(dir.path().to_path_buf());

    assert!(matches!(
        renderer.render("absent", &BTreeMap::new()),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        renderer.render("../secrets", &BTreeMap::new()),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn unconfigured_services_refuse_work() {
    let deploy = Unconfigured.deploy(Path::new("dist")).await;
    assert!(matches!(deploy, Err(AppError::Config(_))));
    let check = Unconfigured.check("https://example.test").await;
    assert!(matches!(check, Err(AppError::Config(_))));
}

#[tokio::test]
async fn unconfigured_collaborators_still_render_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("hello.md"), "Hello {{who}}").expect("write");
    let collaborators = Collaborators::unconfigured(dir.path().to_path_buf());

    let text = collaborators
        .renderer
        .render("hello", &vars(&[("who", "world")]))
        .expect("render");
    assert_eq!(text, "Hello world");
    assert!(collaborators
        .deployer
        .redeploy(Path::new("dist"), "https://example.test")
        .await
        .is_err());
}
