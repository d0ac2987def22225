//! Staging deployments and rewriting the deployment list.

use std::fs;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Deployment, Result, Sysroot, SysrootError};
use crate::refspec::Refspec;
use crate::repo::PruneStats;

impl Sysroot {
    /// Check out `checksum` as a new deployment of `osname` with `origin`.
    ///
    /// The merge deployment's `etc/` is copied over the new tree. When the
    /// head deployment already is `checksum` with the same origin, that
    /// deployment is returned unchanged.
    pub fn deploy(
        &self,
        osname: &str,
        checksum: &str,
        origin: &Refspec,
        merge: Option<&Deployment>,
        cancel: &CancellationToken,
    ) -> Result<Deployment> {
        if cancel.is_cancelled() {
            return Err(SysrootError::Cancelled);
        }

        if let Some(head) = self.deployments.first() {
            if head.osname == osname && head.checksum == checksum && head.origin.as_ref() == Some(origin) {
                debug!(deployment = %head.dir_name(), "Commit is already the head deployment");
                return Ok(head.clone());
            }
        }

        let serial = self
            .deployments
            .iter()
            .filter(|d| d.osname == osname && d.checksum == checksum)
            .map(|d| d.serial + 1)
            .max()
            .unwrap_or(0);
        let deployment = Deployment {
            osname: osname.to_string(),
            checksum: checksum.to_string(),
            serial,
            origin: Some(origin.clone()),
        };

        let dest = self.deployment_dir(&deployment);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| SysrootError::io(&dest, e))?;
        }
        let repo = self.repo()?;
        repo.checkout(checksum, &dest)?;

        if cancel.is_cancelled() {
            let _ = fs::remove_dir_all(&dest);
            return Err(SysrootError::Cancelled);
        }

        if let Some(merge) = merge {
            let merge_etc = self.deployment_dir(merge).join("etc");
            if merge_etc.is_dir() {
                copy_tree(&merge_etc, &dest.join("etc"))?;
            }
        }
        self.write_origin(&deployment, origin)?;

        info!(
            deployment = %deployment.dir_name(),
            osname = %osname,
            origin = %origin,
            "Deployed commit"
        );
        Ok(deployment)
    }

    /// Make `new` the next boot while keeping the booted and merge
    /// deployments; the boot version is bumped when the list changes.
    pub fn simple_write_deployment(&mut self, new: &Deployment, merge: Option<&Deployment>) -> Result<()> {
        let mut list = vec![new.clone()];
        let keep = self
            .booted_deployment()
            .cloned()
            .into_iter()
            .chain(merge.cloned());
        for deployment in keep {
            if !list.iter().any(|d| d.same_as(&deployment)) {
                list.push(deployment);
            }
        }

        let unchanged = list.len() == self.deployments.len()
            && list.iter().zip(&self.deployments).all(|(a, b)| a.same_as(b));
        if unchanged {
            debug!("Deployment list unchanged");
            return Ok(());
        }

        let booted = self.booted_deployment().cloned();
        self.deployments = list;
        self.bootversion += 1;
        self.booted = booted.and_then(|b| self.deployments.iter().position(|d| d.same_as(&b)));
        self.write_deployments_file()?;
        info!(
            bootversion = self.bootversion,
            head = %new.dir_name(),
            "Wrote deployment list"
        );
        Ok(())
    }

    /// Remove deployment trees no longer listed and prune the repository.
    pub fn cleanup(&self) -> Result<PruneStats> {
        let deploy_root = self.root.join("ostree/deploy");
        if deploy_root.is_dir() {
            for os_dir in read_dir(&deploy_root)? {
                let osname = file_name(&os_dir);
                let deploy_dir = os_dir.join("deploy");
                if !deploy_dir.is_dir() {
                    continue;
                }
                for entry in read_dir(&deploy_dir)? {
                    let name = file_name(&entry);
                    let dir_name = name.strip_suffix(".origin").unwrap_or(&name);
                    let listed = self
                        .deployments
                        .iter()
                        .any(|d| d.osname == osname && d.dir_name() == dir_name);
                    if listed {
                        continue;
                    }
                    debug!(path = %entry.display(), "Removing stale deployment");
                    let removed = if entry.is_dir() {
                        fs::remove_dir_all(&entry)
                    } else {
                        fs::remove_file(&entry)
                    };
                    if let Err(e) = removed {
                        warn!(path = %entry.display(), error = %e, "Failed to remove stale deployment");
                    }
                }
            }
        }

        let roots: Vec<String> = self.deployments.iter().map(|d| d.checksum.clone()).collect();
        Ok(self.repo()?.prune(&roots)?)
    }
}

fn read_dir(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| SysrootError::io(dir, e))? {
        entries.push(entry.map_err(|e| SysrootError::io(dir, e))?.path());
    }
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| SysrootError::io(to, e))?;
    for entry in read_dir(from)? {
        let target = to.join(file_name(&entry));
        if entry.is_dir() {
            copy_tree(&entry, &target)?;
        } else {
            fs::copy(&entry, &target).map_err(|e| SysrootError::io(&entry, e))?;
        }
    }
    Ok(())
}
