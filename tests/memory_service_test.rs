//! MemoryService 端到端测试（Mock 补全 + 哈希嵌入 + 内存存储）

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use honeycomb::memory::keeper::KeeperSettings;
    use honeycomb::memory::Role;
    use honeycomb::pool::PoolSettings;
    use honeycomb::{Backends, MemoryService, RestoreMode, RetrievalMode, ServiceSettings};

    fn settings(k: usize, n: usize, capacity: usize) -> ServiceSettings {
        ServiceSettings {
            keeper: KeeperSettings {
                buffer_size: k,
                retained_turns: n,
                ..KeeperSettings::default()
            },
            pool: PoolSettings {
                max_sessions: capacity,
                session_ttl: Duration::from_secs(600),
                sweep_interval: Duration::from_secs(60),
            },
            retrieval_mode: RetrievalMode::Auto,
            reflect_on_end: true,
            ..ServiceSettings::default()
        }
    }

    #[tokio::test]
    async fn test_compaction_scenario_k10_n5() {
        let service = MemoryService::new(Backends::mock(), settings(10, 5, 16)).unwrap();
        service
            .resolve_session("alice", Some("trip"), RestoreMode::Fresh)
            .await
            .unwrap();
        for i in 1..=10 {
            service
                .append_turn("alice", "trip", Role::User, &format!("note number {i}"))
                .await
                .unwrap();
        }
        let context = service.get_context("alice", "trip").await.unwrap();
        assert!(context.contains("user: note number 6"));
        assert!(!context.contains("user: note number 5"));

        service
            .append_turn("alice", "trip", Role::User, "note number 11")
            .await
            .unwrap();
        service
            .append_turn("alice", "trip", Role::User, "note number 12")
            .await
            .unwrap();
        let context = service.get_context("alice", "trip").await.unwrap();
        assert!(context.contains("user: note number 12"));

        let report = service.end_session("alice", "trip").await.unwrap();
        assert!(!report.summary.summary.is_empty());
        assert_eq!(service.pool_stats().count, 0);
    }

    #[tokio::test]
    async fn test_state_survives_service_restart() {
        let backends = Backends::mock();
        let first = MemoryService::new(backends.clone(), settings(10, 5, 16)).unwrap();
        first
            .append_turn("bob", "s1", Role::User, "My favorite editor is helix")
            .await
            .unwrap();
        first
            .append_turn("bob", "s1", Role::Assistant, "Helix is a fine modal editor")
            .await
            .unwrap();
        assert_eq!(first.shutdown().await.unwrap(), 1);

        let second = MemoryService::new(backends, settings(10, 5, 16)).unwrap();
        let resolved = second
            .resolve_session("bob", Some("s1"), RestoreMode::Only)
            .await
            .unwrap();
        assert!(resolved.context.contains("user: My favorite editor is helix"));
        assert!(resolved.context.contains("assistant: Helix is a fine modal editor"));
    }

    #[tokio::test]
    async fn test_eviction_under_capacity_pressure_keeps_state() {
        let service = MemoryService::new(Backends::mock(), settings(10, 5, 2)).unwrap();
        for session in ["a", "b", "c", "d"] {
            service
                .append_turn("carol", session, Role::User, &format!("hello from {session}"))
                .await
                .unwrap();
            assert!(service.pool_stats().count <= 2);
        }
        let context = service.get_context("carol", "a").await.unwrap();
        assert!(context.contains("user: hello from a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_sessions_run_concurrently() {
        let service = Arc::new(MemoryService::new(Backends::mock(), settings(4, 2, 64)).unwrap());
        let tasks: Vec<_> = (0..8)
            .map(|s| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let session = format!("s{s}");
                    for t in 0..9 {
                        service
                            .append_turn("dave", &session, Role::User, &format!("turn {t} of {session}"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(service.pool_stats().count, 8);
        for s in 0..8 {
            let context = service.get_context("dave", &format!("s{s}")).await.unwrap();
            assert!(context.contains(&format!("turn 8 of s{s}")));
        }
    }

    #[tokio::test]
    async fn test_reflection_pipeline_end_to_end() {
        let service = MemoryService::new(Backends::mock(), settings(10, 5, 16)).unwrap();
        service
            .append_turn("erin", "s1", Role::User, "I prefer vegetarian restaurants")
            .await
            .unwrap();
        service
            .append_turn("erin", "s1", Role::Assistant, "I will remember that")
            .await
            .unwrap();
        let report = service.end_session("erin", "s1").await.unwrap();
        assert_eq!(report.insights.len(), 1);
        assert_eq!(report.insights[0].category, "preference");

        service
            .append_turn("erin", "s2", Role::User, "so, how was your weekend")
            .await
            .unwrap();
        let small_talk = service.end_session("erin", "s2").await.unwrap();
        assert!(small_talk.insights.is_empty());

        let outcome = service.run_longterm_reflection("erin").await.unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.consumed, 1);
        let profile = service.longterm_profile("erin").await.unwrap().unwrap();
        assert!(profile.insight_text.contains("vegetarian"));

        let unchanged = service.run_longterm_reflection("erin").await.unwrap();
        assert!(!unchanged.updated);
        let again = service.longterm_profile("erin").await.unwrap().unwrap();
        assert_eq!(profile, again);

        let recalled = service
            .get_context_with_recall("erin", "s3", "vegetarian restaurants")
            .await
            .unwrap();
        assert!(recalled.contains("<session_initialization>"));
        assert!(recalled.contains("### Recalled Facts"));
    }
}
