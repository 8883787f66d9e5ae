use super::*;
use wf_domain::{CondaEnv, StaticGraph};

#[test]
fn cleanup_metadata_drops_one_record() -> Result<()> {
    let ws = workspace()?;
    let job = ws.job(Rule::new("r"), &["a.txt", "b.txt"]);
    ws.persistence.finished(&job, true)?;
    assert!(ws.persistence.cleanup_metadata(&ws.path("a.txt"))?);
    assert!(!ws.persistence.cleanup_metadata(&ws.path("a.txt"))?);
    assert!(ws.persistence.metadata(&ws.path("a.txt"))?.is_empty());
    assert!(ws.persistence.rule(&ws.path("b.txt"))?.is_some());
    Ok(())
}

#[test]
fn cleanup_shadow_empties_the_directory() -> Result<()> {
    let ws = workspace()?;
    let scratch = ws.persistence.shadow_dir().join("tmpabc").join("out.txt");
    fs::create_dir_all(scratch.parent().expect("parent"))?;
    fs::write(&scratch, b"x")?;
    ws.persistence.cleanup_shadow()?;
    assert!(ws.persistence.shadow_dir().is_dir());
    assert_eq!(fs::read_dir(ws.persistence.shadow_dir())?.count(), 0);
    Ok(())
}

#[test]
fn unused_container_images_are_removed() -> Result<()> {
    let ws = workspace()?;
    let used = ws.persistence.container_img_path("docker://alpine:3");
    let unused = ws.persistence.container_img_path("docker://busybox:1");
    let unrelated = ws.persistence.container_img_dir().join("notes.txt");
    fs::write(&used, vec![0u8; 16])?;
    fs::write(&unused, vec![0u8; 2048])?;
    fs::write(&unrelated, b"keep")?;

    let graph = StaticGraph::new(vec![ws
        .job(Rule::new("r"), &["out.txt"])
        .with_container("docker://alpine:3")]);
    let summary = ws.persistence.cleanup_containers(&graph)?;
    assert_eq!(
        summary,
        ContainerCleanup {
            removed: 1,
            reclaimed_bytes: 2048
        }
    );
    assert!(used.exists());
    assert!(!unused.exists());
    assert!(unrelated.exists());

    assert_eq!(
        ws.persistence.cleanup_containers(&graph)?,
        ContainerCleanup::default()
    );
    Ok(())
}

#[test]
fn unused_environments_and_archives_are_removed() -> Result<()> {
    let ws = workspace()?;
    let used = CondaEnv::new("deps: [python]");
    let stale = CondaEnv::new("deps: [perl]");
    let envs = ws.persistence.conda_env_dir();
    let archives = ws.persistence.conda_env_archive_dir();

    let used_dir = envs.join(format!("{}_", &used.hash[..8]));
    let stale_dir = envs.join(&stale.hash[..8]);
    let stale_yaml = envs.join(format!("{}.yaml", &stale.hash[..8]));
    let short = envs.join("tiny");
    for dir in [&used_dir, &stale_dir, &short] {
        fs::create_dir_all(dir)?;
    }
    fs::write(&stale_yaml, b"deps: [perl]")?;
    fs::create_dir_all(archives.join(&used.content_hash))?;
    fs::create_dir_all(archives.join(&stale.content_hash))?;

    let graph = StaticGraph::new(vec![ws
        .job(Rule::new("r"), &["out.txt"])
        .with_conda_env(used.clone())]);
    ws.persistence.conda_cleanup_envs(&graph)?;

    assert!(used_dir.exists());
    assert!(!stale_dir.exists());
    assert!(!stale_yaml.exists());
    assert!(short.exists(), "names shorter than a hash prefix are ignored");
    assert!(archives.join(&used.content_hash).exists());
    assert!(!archives.join(&stale.content_hash).exists());
    Ok(())
}

#[test]
fn locking_goes_through_the_graph() -> Result<()> {
    let mut ws = workspace()?;
    ws.touch("raw.txt")?;
    let graph = StaticGraph::new(vec![ws
        .job(Rule::new("r"), &["out.txt"])
        .with_input(ws.file("raw.txt"))]);
    ws.persistence.lock(&graph)?;

    let mut other = ws.reopen()?;
    assert!(other.locked(&graph)?);
    assert_eq!(other.lock_conflict(&graph)?, Some(ws.path("out.txt")));
    assert!(other.lock(&graph).is_err());

    ws.persistence.unlock()?;
    assert!(!other.locked(&graph)?);
    other.lock(&graph)?;
    other.cleanup_locks()?;
    assert!(!ws.persistence.locked(&graph)?);
    Ok(())
}
