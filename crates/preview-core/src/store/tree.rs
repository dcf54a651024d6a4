//! Read-only inspection of committed trees.

use std::path::Path;

use git2::{ErrorCode, ObjectType, Repository};

/// Names of the immediate children of `subdir` in the HEAD tree, sorted.
///
/// A missing path, or an unborn HEAD, yields an empty list.
pub fn head_children(repo_path: &Path, subdir: &str) -> Result<Vec<String>, git2::Error> {
    let repo = Repository::open(repo_path)?;
    let head = match repo.head() {
        Ok(head) => head,
        Err(err) if err.code() == ErrorCode::UnbornBranch || err.code() == ErrorCode::NotFound => {
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };
    let tree = head.peel_to_commit()?.tree()?;

    let subtree = match tree.get_path(Path::new(subdir)) {
        Ok(entry) if entry.kind() == Some(ObjectType::Tree) => {
            entry.to_object(&repo)?.peel_to_tree()?
        }
        Ok(_) => return Ok(Vec::new()),
        Err(err) if err.code() == ErrorCode::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut names: Vec<String> = subtree
        .iter()
        .filter_map(|entry| entry.name().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

/// Full hash of the HEAD commit.
pub fn head_revision(repo_path: &Path) -> Result<String, git2::Error> {
    let repo = Repository::open(repo_path)?;
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{IndexAddOption, Signature};
    use tempfile::TempDir;

    fn commit_all(repo: &Repository, message: &str) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index
            .update_all(["*"].iter(), None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
    }

    #[test]
    fn lists_committed_children_only() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init(temp.path()).unwrap();
        std::fs::create_dir_all(temp.path().join("pr-preview/42")).unwrap();
        std::fs::create_dir_all(temp.path().join("pr-preview/43")).unwrap();
        std::fs::write(temp.path().join("pr-preview/42/index.html"), "42").unwrap();
        std::fs::write(temp.path().join("pr-preview/43/index.html"), "43").unwrap();
        std::fs::write(temp.path().join("index.html"), "site").unwrap();
        commit_all(&repo, "init");

        std::fs::create_dir_all(temp.path().join("pr-preview/44")).unwrap();
        std::fs::write(temp.path().join("pr-preview/44/index.html"), "44").unwrap();

        let children = head_children(temp.path(), "pr-preview").unwrap();
        assert_eq!(children, vec!["42".to_string(), "43".to_string()]);
        assert_eq!(head_revision(temp.path()).unwrap().len(), 40);
    }

    #[test]
    fn missing_paths_and_unborn_head_are_empty() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init(temp.path()).unwrap();
        assert!(head_children(temp.path(), "pr-preview").unwrap().is_empty());

        std::fs::write(temp.path().join("pr-preview"), "a file, not a dir").unwrap();
        commit_all(&repo, "init");
        assert!(head_children(temp.path(), "pr-preview").unwrap().is_empty());
        assert!(head_children(temp.path(), "elsewhere").unwrap().is_empty());
    }
}
