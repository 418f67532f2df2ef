//! 管理器租约
//!
//! 管理器文档是单例, 每个周期开始时通过事务认领并递增迭代号。
//! 之后对管理器文档的每次修改都以认领得到的迭代号为栅栏。

use billing_core::models::{ensure_iteration, ManagerMetadata, ManagerState};
use billing_core::{PipelineError, PipelineResult};
use billing_domain::{ManagerKind, MetadataStore, Transactor};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// 读取管理器文档, 不存在时以 `Done` 状态创建
pub async fn ensure_manager(
    store: &MetadataStore,
    kind: ManagerKind,
) -> PipelineResult<ManagerMetadata> {
    match store.managers.find(kind.key()).await? {
        Some(manager) => Ok(manager),
        None => {
            info!("创建 {} 管理器文档", kind);
            match store
                .managers
                .create(kind.key(), ManagerMetadata::default())
                .await
            {
                Ok(()) | Err(PipelineError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
            store.manager(kind).await
        }
    }
}

/// 认领管理器, 返回认领后的文档
///
/// 上一轮没有结束且租约未过期时拒绝; 租约过期则接管。
pub async fn catch(
    store: &MetadataStore,
    kind: ManagerKind,
    ttl: Duration,
    now: DateTime<Utc>,
) -> PipelineResult<ManagerMetadata> {
    let current = ensure_manager(store, kind).await?;
    let expected = current.iteration;

    let claimed = store
        .managers
        .apply(kind.key(), &move |mut manager: ManagerMetadata| -> PipelineResult<ManagerMetadata> {
            ensure_iteration(expected, manager.iteration)?;
            let lease = manager.lease();
            if !manager.state.is_terminal() {
                if !lease.is_expired(now) {
                    return Err(PipelineError::LeaseHeld {
                        iteration: lease.holder_iteration,
                        remaining_seconds: lease.remaining_seconds(now),
                    });
                }
                warn!(
                    "{} 管理器迭代 {} 租约已过期 (状态 {}), 接管",
                    kind, manager.iteration, manager.state
                );
            }
            manager.iteration += 1;
            manager.ttl = Some(now + ttl);
            manager.state = ManagerState::Started;
            manager.aggregate_job = None;
            manager.recovery.recovering = false;
            Ok(manager)
        })
        .await?;

    info!("{} 管理器开始迭代 {}", kind, claimed.iteration);
    Ok(claimed)
}

/// 在迭代号栅栏下修改管理器文档
pub async fn update_manager<F>(
    store: &MetadataStore,
    kind: ManagerKind,
    iteration: i64,
    update: F,
) -> PipelineResult<ManagerMetadata>
where
    F: Fn(&mut ManagerMetadata) -> PipelineResult<()> + Send + Sync,
{
    store
        .managers
        .apply(kind.key(), &move |mut manager: ManagerMetadata| -> PipelineResult<ManagerMetadata> {
            ensure_iteration(iteration, manager.iteration)?;
            update(&mut manager)?;
            Ok(manager)
        })
        .await
}

/// 推进管理器状态
pub async fn advance(
    store: &MetadataStore,
    kind: ManagerKind,
    iteration: i64,
    state: ManagerState,
) -> PipelineResult<ManagerMetadata> {
    debug!("{} 管理器迭代 {} -> {}", kind, iteration, state);
    update_manager(store, kind, iteration, move |manager| {
        manager.state = state;
        Ok(())
    })
    .await
}

pub async fn tear_down(
    store: &MetadataStore,
    kind: ManagerKind,
    iteration: i64,
) -> PipelineResult<ManagerMetadata> {
    advance(store, kind, iteration, ManagerState::Done).await
}

pub async fn mark_failed(
    store: &MetadataStore,
    kind: ManagerKind,
    iteration: i64,
) -> PipelineResult<ManagerMetadata> {
    advance(store, kind, iteration, ManagerState::Failed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_infrastructure::InMemoryMetadata;

    #[tokio::test]
    async fn test_second_catch_is_rejected_until_ttl_lapses() {
        let store = InMemoryMetadata::new(20).store();
        let now = Utc::now();

        let first = catch(&store, ManagerKind::External, Duration::minutes(60), now)
            .await
            .unwrap();
        assert_eq!(first.iteration, 1);
        assert_eq!(first.state, ManagerState::Started);

        let err = catch(&store, ManagerKind::External, Duration::minutes(60), now)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LeaseHeld { iteration: 1, .. }));

        let later = now + Duration::minutes(61);
        let second = catch(&store, ManagerKind::External, Duration::minutes(60), later)
            .await
            .unwrap();
        assert_eq!(second.iteration, 2);
    }

    #[tokio::test]
    async fn test_finished_cycle_can_be_caught_immediately() {
        let store = InMemoryMetadata::new(20).store();
        let now = Utc::now();
        let first = catch(&store, ManagerKind::Internal, Duration::minutes(60), now)
            .await
            .unwrap();
        tear_down(&store, ManagerKind::Internal, first.iteration)
            .await
            .unwrap();

        let second = catch(&store, ManagerKind::Internal, Duration::minutes(60), now)
            .await
            .unwrap();
        assert_eq!(second.iteration, first.iteration + 1);
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_advance() {
        let store = InMemoryMetadata::new(20).store();
        let now = Utc::now();
        let first = catch(&store, ManagerKind::Internal, Duration::minutes(1), now)
            .await
            .unwrap();
        catch(
            &store,
            ManagerKind::Internal,
            Duration::minutes(1),
            now + Duration::minutes(2),
        )
        .await
        .unwrap();

        let err = advance(
            &store,
            ManagerKind::Internal,
            first.iteration,
            ManagerState::TmpTableCreated,
        )
        .await
        .unwrap_err();
        assert!(err.is_stale_iteration());
        assert_eq!(
            store.manager(ManagerKind::Internal).await.unwrap().state,
            ManagerState::Started
        );
    }
}
