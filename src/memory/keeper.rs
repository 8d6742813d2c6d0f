//! MemoryKeeper：单个会话的缓冲区、累计摘要与压缩状态机
//!
//! Accumulating（缓冲 < k）→ Compacting（追加使缓冲达到 k）→ Accumulating（缓冲截为尾部 n 轮）；
//! 会话结束时强制压缩剩余轮次后进入 Frozen。
//!
//! 压缩按 generation 生成确定性 chunk id：chunk 已写入而后续步骤失败时，重试会复用已存的
//! chunk（内部视为 CompactionConflict），不会重复写入，也不会重复折叠摘要。
//! 调用方（SessionPool）保证同一会话的所有操作串行。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::error::{MemoryError, MemoryResult};
use crate::core::Backends;
use crate::memory::conversation::{flatten_turns, Role, Turn};
use crate::memory::extraction::{self, FALLBACK_SESSION_SUMMARY};
use crate::memory::model::{
    ChunkMetadata, InteractionChunk, LongTermInsight, RecentSummary,
    ReflectionStatus, SessionInitBlock, SessionInsight, SessionSnapshot, SessionStatus,
    SessionSummary,
};
use crate::memory::prompts;
use crate::reflection::ReflectionPipeline;
use crate::store::StoreQuery;

/// 冷路径最多扫描的 chunk 数
const CHUNK_SCAN_LIMIT: usize = 10_000;
/// 无长期画像时用作画像的最近会话洞察数
const INIT_FALLBACK_INSIGHTS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct KeeperSettings {
    /// 压缩阈值 k
    pub buffer_size: usize,
    /// 压缩后保留的尾部轮数 n（n < k）
    pub retained_turns: usize,
    pub recent_sessions_for_init: usize,
    /// 无快照时用于重建累计摘要的最近 chunk 数
    pub restore_chunks: usize,
}

impl Default for KeeperSettings {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            retained_turns: 5,
            recent_sessions_for_init: 2,
            restore_chunks: 2,
        }
    }
}

impl KeeperSettings {
    /// 要求 1 <= n < k
    pub fn validate(&self) -> MemoryResult<()> {
        if self.buffer_size == 0 {
            return Err(MemoryError::Config("buffer_size must be at least 1".into()));
        }
        if self.retained_turns == 0 {
            return Err(MemoryError::Config("retained_turns must be at least 1".into()));
        }
        if self.retained_turns >= self.buffer_size {
            return Err(MemoryError::Config(format!(
                "retained_turns ({}) must be smaller than buffer_size ({})",
                self.retained_turns, self.buffer_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperPhase {
    Accumulating,
    Compacting,
    Frozen,
}

/// append_turn 的结果；三种情况下轮次都已记录
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    Buffered,
    /// 触发了压缩，generation 为刚提交的压缩编号
    Compacted { generation: u64 },
    /// 压缩失败，缓冲保持在 k，下次追加前重试
    CompactionDeferred { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionReport {
    pub generation: u64,
    pub chunk_id: String,
    /// chunk 在此前的尝试中已写入
    pub reused: bool,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// end_session 的结果
#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub summary: SessionSummary,
    pub insights: Vec<SessionInsight>,
}

pub struct MemoryKeeper {
    user_id: String,
    session_id: String,
    settings: KeeperSettings,
    backends: Backends,
    buffer: Vec<Turn>,
    cumulative_summary: String,
    next_seq: u64,
    generation: u64,
    folded_generation: u64,
    compacted_through_seq: u64,
    init_block: SessionInitBlock,
    status: SessionStatus,
    reflection_status: ReflectionStatus,
    phase: KeeperPhase,
    started_at: DateTime<Utc>,
    dirty: Arc<AtomicBool>,
}

impl MemoryKeeper {
    /// 新会话：计算一次会话初始化块。
    /// 该会话键已有持久化记录时，序号与 generation 接在已存记录之后，不复用旧 chunk；
    /// 已结束的会话不能重新开始。
    pub async fn create(
        backends: Backends,
        settings: KeeperSettings,
        user_id: &str,
        session_id: &str,
    ) -> MemoryResult<Self> {
        let counters = persisted_counters(&backends, user_id, session_id).await?;
        if counters.ended {
            return Err(MemoryError::SessionEnded {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        let init_block = build_init_block(&backends, &settings, user_id, session_id).await?;
        tracing::info!(
            user_id,
            session_id,
            init_empty = init_block.is_empty(),
            generation = counters.generation,
            next_seq = counters.next_seq,
            "session created"
        );
        Ok(Self::from_parts(
            backends,
            settings,
            SessionSnapshot {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
                status: SessionStatus::Active,
                reflection_status: ReflectionStatus::Pending,
                buffer: Vec::new(),
                cumulative_summary: String::new(),
                next_seq: counters.next_seq,
                generation: counters.generation,
                folded_generation: counters.generation,
                compacted_through_seq: counters.next_seq - 1,
                init_block,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            },
            true,
        ))
    }

    /// 冷恢复：优先读快照；无快照时从会话摘要与最近 chunk 重建；都没有返回 None
    pub async fn restore(
        backends: Backends,
        settings: KeeperSettings,
        user_id: &str,
        session_id: &str,
    ) -> MemoryResult<Option<Self>> {
        let snapshot_id = SessionSnapshot::id_for(user_id, session_id);
        if let Some((snapshot, _)) = backends.fetch::<SessionSnapshot>(&snapshot_id).await? {
            tracing::info!(
                user_id,
                session_id,
                turns = snapshot.buffer.len(),
                generation = snapshot.generation,
                "session restored from snapshot"
            );
            return Ok(Some(Self::from_parts(backends, settings, snapshot, false)));
        }

        let summary = backends
            .fetch::<SessionSummary>(&SessionSummary::id_for(user_id, session_id))
            .await?
            .map(|(s, _)| s);
        let mut chunks: Vec<InteractionChunk> = backends
            .query_typed(
                &StoreQuery::new()
                    .filter("user_id", user_id)
                    .filter("session_id", session_id)
                    .order_by_desc("generation"),
                CHUNK_SCAN_LIMIT,
            )
            .await?;
        if summary.is_none() && chunks.is_empty() {
            return Ok(None);
        }

        // chunks 按 generation 降序；最新的一块决定计数器
        let (generation, last_seq, started_at) = match chunks.first() {
            Some(latest) => (
                latest.generation + 1,
                latest.last_seq,
                chunks.last().map_or(latest.timestamp, |c| c.timestamp),
            ),
            None => (0, 0, summary.as_ref().map_or_else(Utc::now, |s| s.start_time)),
        };
        chunks.truncate(settings.restore_chunks.max(1));
        let cumulative_summary = chunks
            .iter()
            .rev()
            .map(|c| c.summary.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let init_block = build_init_block(&backends, &settings, user_id, session_id).await?;
        tracing::info!(user_id, session_id, generation, "session rebuilt from chunks");

        let snapshot = SessionSnapshot {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            status: summary.as_ref().map_or(SessionStatus::Active, |s| s.status),
            reflection_status: summary
                .as_ref()
                .map_or(ReflectionStatus::Pending, |s| s.reflection_status),
            buffer: Vec::new(),
            cumulative_summary,
            next_seq: last_seq + 1,
            generation,
            folded_generation: generation,
            compacted_through_seq: last_seq,
            init_block,
            started_at,
            updated_at: Utc::now(),
        };
        Ok(Some(Self::from_parts(backends, settings, snapshot, true)))
    }

    fn from_parts(
        backends: Backends,
        settings: KeeperSettings,
        snapshot: SessionSnapshot,
        dirty: bool,
    ) -> Self {
        let phase = match snapshot.status {
            SessionStatus::Active => KeeperPhase::Accumulating,
            SessionStatus::Ended => KeeperPhase::Frozen,
        };
        Self {
            user_id: snapshot.user_id,
            session_id: snapshot.session_id,
            settings,
            backends,
            buffer: snapshot.buffer,
            cumulative_summary: snapshot.cumulative_summary,
            next_seq: snapshot.next_seq,
            generation: snapshot.generation,
            folded_generation: snapshot.folded_generation,
            compacted_through_seq: snapshot.compacted_through_seq,
            init_block: snapshot.init_block,
            status: snapshot.status,
            reflection_status: snapshot.reflection_status,
            phase,
            started_at: snapshot.started_at,
            dirty: Arc::new(AtomicBool::new(dirty)),
        }
    }

    fn resting_phase(&self) -> KeeperPhase {
        match self.status {
            SessionStatus::Active => KeeperPhase::Accumulating,
            SessionStatus::Ended => KeeperPhase::Frozen,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn buffer(&self) -> &[Turn] {
        &self.buffer
    }

    pub fn cumulative_summary(&self) -> &str {
        &self.cumulative_summary
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> KeeperPhase {
        self.phase
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn reflection_status(&self) -> ReflectionStatus {
        self.reflection_status
    }

    pub fn init_block(&self) -> &SessionInitBlock {
        &self.init_block
    }

    /// 与池条目共享的 dirty 标志
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn ended_error(&self) -> MemoryError {
        MemoryError::SessionEnded {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// 追加一轮；缓冲达到 k 时同步压缩
    pub async fn append_turn(
        &mut self,
        role: Role,
        content: impl Into<String>,
    ) -> MemoryResult<AppendOutcome> {
        if self.status == SessionStatus::Ended {
            return Err(self.ended_error());
        }
        let k = self.settings.buffer_size;

        // 上次压缩失败留下满缓冲：先补做，失败则拒绝本次追加以保持 len <= k
        if self.buffer.len() >= k {
            tracing::info!(
                user_id = %self.user_id,
                session_id = %self.session_id,
                generation = self.generation,
                "retrying deferred compaction"
            );
            self.compact().await?;
        }

        let turn = Turn::new(self.next_seq, role, content);
        self.next_seq += 1;
        self.buffer.push(turn);
        self.mark_dirty();

        if self.buffer.len() < k {
            return Ok(AppendOutcome::Buffered);
        }
        match self.compact().await {
            Ok(Some(report)) => Ok(AppendOutcome::Compacted {
                generation: report.generation,
            }),
            Ok(None) => Ok(AppendOutcome::Buffered),
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    generation = self.generation,
                    error = %e,
                    "compaction failed, buffer kept at threshold"
                );
                Ok(AppendOutcome::CompactionDeferred {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// 压缩当前缓冲；缓冲中没有尚未归属任何 chunk 的轮次时返回 None
    pub async fn compact(&mut self) -> MemoryResult<Option<CompactionReport>> {
        let owned_from_seq = self.compacted_through_seq + 1;
        let Some(last) = self.buffer.last() else {
            return Ok(None);
        };
        if last.seq < owned_from_seq {
            return Ok(None);
        }

        // 调用方中途取消时 phase 会停在 Compacting；下次压缩结束时按 status 恢复
        self.phase = KeeperPhase::Compacting;
        let result = self.compact_inner(owned_from_seq).await;
        self.phase = self.resting_phase();
        result.map(Some)
    }

    async fn compact_inner(&mut self, owned_from_seq: u64) -> MemoryResult<CompactionReport> {
        let generation = self.generation;
        let chunk_id = InteractionChunk::id_for(&self.user_id, &self.session_id, generation);

        let (chunk, reused) = match self.backends.fetch::<InteractionChunk>(&chunk_id).await? {
            Some((existing, _)) => {
                let conflict = MemoryError::CompactionConflict {
                    session_id: self.session_id.clone(),
                    generation,
                };
                // 只有覆盖同一段缓冲的 chunk 才是本会话上次未完成的尝试
                let first_seq = self.buffer.first().map(|t| t.seq);
                let last_seq = self.buffer.last().map_or(0, |t| t.seq);
                let same_attempt = existing.owned_from_seq == owned_from_seq
                    && Some(existing.first_seq) == first_seq
                    && existing.last_seq == last_seq;
                if !same_attempt {
                    tracing::error!(
                        user_id = %self.user_id,
                        session_id = %self.session_id,
                        generation,
                        stored_owned_from = existing.owned_from_seq,
                        stored_first = existing.first_seq,
                        expected_owned_from = owned_from_seq,
                        "persisted chunk does not match the buffer"
                    );
                    return Err(conflict);
                }
                tracing::info!(
                    user_id = %self.user_id,
                    generation,
                    %conflict,
                    "chunk already persisted, reusing it"
                );
                (existing, true)
            }
            None => (self.write_chunk(&chunk_id, owned_from_seq).await?, false),
        };

        // 折叠：folded_generation 记录已并入累计摘要的块数
        if self.folded_generation <= generation {
            let folded = self
                .backends
                .complete(
                    "fold_summary",
                    &prompts::fold_summary(&self.cumulative_summary, &chunk.summary),
                )
                .await?;
            let folded = folded.trim();
            self.cumulative_summary = if folded.is_empty() {
                join_summary(&self.cumulative_summary, &chunk.summary)
            } else {
                folded.to_string()
            };
            self.folded_generation = generation + 1;
        }

        // 保留 chunk 末尾之前的 n 轮，以及 chunk 之后追加的轮次
        let keep_from = self
            .buffer
            .iter()
            .position(|t| t.seq > chunk.last_seq)
            .unwrap_or(self.buffer.len());
        let tail_start = keep_from.saturating_sub(self.settings.retained_turns);
        self.buffer.drain(..tail_start);
        self.compacted_through_seq = self.compacted_through_seq.max(chunk.last_seq);
        self.generation = generation + 1;
        self.mark_dirty();

        tracing::info!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            generation,
            first_seq = chunk.first_seq,
            last_seq = chunk.last_seq,
            retained = self.buffer.len(),
            reused,
            "compaction committed"
        );
        Ok(CompactionReport {
            generation,
            chunk_id,
            reused,
            first_seq: chunk.first_seq,
            last_seq: chunk.last_seq,
        })
    }

    async fn write_chunk(
        &self,
        chunk_id: &str,
        owned_from_seq: u64,
    ) -> MemoryResult<InteractionChunk> {
        let turns = &self.buffer;
        let (Some(first), Some(last)) = (turns.first(), turns.last()) else {
            return Err(MemoryError::Store("compaction on empty buffer".into()));
        };
        let content = flatten_turns(turns);
        let owned: Vec<Turn> = turns
            .iter()
            .filter(|t| t.seq >= owned_from_seq)
            .cloned()
            .collect();

        let raw = self
            .backends
            .complete("chunk_metadata", &prompts::chunk_metadata(&content))
            .await?;
        let (summary, metadata) = match extraction::parse_chunk_analysis(&raw) {
            Ok(analysis) => (
                analysis.summary,
                ChunkMetadata {
                    mentioned_topics: analysis.mentioned_topics,
                    entities: analysis.entities,
                },
            ),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "chunk metadata malformed, using raw excerpt");
                (excerpt(&flatten_turns(&owned), 240), ChunkMetadata::default())
            }
        };

        let content_vector = self.backends.embed(&content).await?;
        let summary_vector = self.backends.embed(&summary).await?;

        let chunk = InteractionChunk {
            id: chunk_id.to_string(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            generation: self.generation,
            first_seq: first.seq,
            last_seq: last.seq,
            owned_from_seq,
            timestamp: first.timestamp,
            created_at: Utc::now(),
            owned_content: flatten_turns(&owned),
            content,
            content_vector,
            summary,
            summary_vector,
            metadata,
        };
        self.backends.put(&chunk).await?;
        Ok(chunk)
    }

    /// 上下文块：初始化块 + 累计摘要 + 活动缓冲（纯读）
    pub fn get_context(&self) -> String {
        let mut parts = Vec::new();
        let init = self.init_block.render();
        if !init.is_empty() {
            parts.push(init);
        }
        if !self.cumulative_summary.is_empty() {
            parts.push(format!("### Conversation Summary\n{}", self.cumulative_summary));
        }
        if !self.buffer.is_empty() {
            parts.push(format!("### Active Conversation\n{}", flatten_turns(&self.buffer)));
        }
        parts.join("\n\n")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            reflection_status: self.reflection_status,
            buffer: self.buffer.clone(),
            cumulative_summary: self.cumulative_summary.clone(),
            next_seq: self.next_seq,
            generation: self.generation,
            folded_generation: self.folded_generation,
            compacted_through_seq: self.compacted_through_seq,
            init_block: self.init_block.clone(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        }
    }

    /// 写入会话快照并清除 dirty；已结束会话的快照不会被活动状态覆盖
    pub async fn persist_snapshot(&self) -> MemoryResult<()> {
        let snapshot = self.snapshot();
        if self.status == SessionStatus::Active {
            let id = SessionSnapshot::id_for(&self.user_id, &self.session_id);
            if let Some((stored, _)) = self.backends.fetch::<SessionSnapshot>(&id).await? {
                if stored.status == SessionStatus::Ended {
                    tracing::warn!(
                        user_id = %self.user_id,
                        session_id = %self.session_id,
                        "stored snapshot already ended, skipping stale write"
                    );
                    self.dirty.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
        self.backends.put(&snapshot).await?;
        self.dirty.store(false, Ordering::SeqCst);
        tracing::debug!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            turns = snapshot.buffer.len(),
            "snapshot persisted"
        );
        Ok(())
    }

    /// 结束会话：强制压缩剩余轮次、生成会话摘要、冻结，然后执行会话反思。
    /// 重复调用：反思仍为 Pending 时只重跑反思，否则返回已存结果。
    pub async fn end_session(
        &mut self,
        reflection: Option<&ReflectionPipeline>,
    ) -> MemoryResult<SessionReport> {
        let summary_id = SessionSummary::id_for(&self.user_id, &self.session_id);

        let stored = if self.status == SessionStatus::Ended {
            self.backends
                .fetch::<SessionSummary>(&summary_id)
                .await?
                .map(|(s, _)| s)
        } else {
            None
        };
        let summary = match stored {
            Some(summary) => summary,
            None => self.finish().await?,
        };

        let report = match (reflection, summary.reflection_status) {
            (Some(pipeline), ReflectionStatus::Pending) => {
                let outcome = pipeline
                    .reflect_session(&self.user_id, &self.session_id)
                    .await?;
                SessionReport {
                    summary: outcome.summary,
                    insights: outcome.insights,
                }
            }
            (Some(pipeline), _) => SessionReport {
                insights: pipeline.insights_for(&summary).await?,
                summary,
            },
            (None, _) => SessionReport {
                summary,
                insights: Vec::new(),
            },
        };

        if self.reflection_status != report.summary.reflection_status {
            self.reflection_status = report.summary.reflection_status;
            self.mark_dirty();
            self.persist_snapshot().await?;
        }
        Ok(report)
    }

    /// 最终压缩 + 会话摘要 + 冻结
    async fn finish(&mut self) -> MemoryResult<SessionSummary> {
        let final_turns = self
            .buffer
            .iter()
            .filter(|t| t.seq > self.compacted_through_seq)
            .cloned()
            .collect::<Vec<_>>();
        self.compact().await?;

        let mut final_content = flatten_turns(&final_turns);
        if final_content.is_empty() && self.generation > 0 {
            // 上次结束在会话分析处失败：最后一块已提交，改用它归属的内容
            let last_chunk =
                InteractionChunk::id_for(&self.user_id, &self.session_id, self.generation - 1);
            if let Some((chunk, _)) = self.backends.fetch::<InteractionChunk>(&last_chunk).await? {
                final_content = chunk.owned_content;
            }
        }
        let (summary_text, key_topics) = if self.cumulative_summary.is_empty() && final_content.is_empty() {
            (FALLBACK_SESSION_SUMMARY.to_string(), Vec::new())
        } else {
            let raw = self
                .backends
                .complete(
                    "session_analysis",
                    &prompts::session_analysis(&self.cumulative_summary, &final_content),
                )
                .await?;
            match extraction::parse_session_analysis(&raw) {
                Ok(analysis) => (analysis.summary, analysis.key_topics),
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "session analysis malformed, using cumulative summary");
                    let text = if self.cumulative_summary.is_empty() {
                        FALLBACK_SESSION_SUMMARY.to_string()
                    } else {
                        self.cumulative_summary.clone()
                    };
                    (text, Vec::new())
                }
            }
        };

        let summary_vector = self.backends.embed(&summary_text).await?;
        let summary = SessionSummary {
            id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            start_time: self.started_at,
            end_time: Utc::now(),
            summary: summary_text,
            summary_vector,
            key_topics,
            extracted_insights: Vec::new(),
            status: SessionStatus::Ended,
            reflection_status: ReflectionStatus::Pending,
        };
        self.backends.put(&summary).await?;

        self.status = SessionStatus::Ended;
        self.reflection_status = ReflectionStatus::Pending;
        self.phase = KeeperPhase::Frozen;
        self.buffer.clear();
        self.mark_dirty();
        self.persist_snapshot().await?;
        tracing::info!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            chunks = self.generation,
            "session ended"
        );
        Ok(summary)
    }
}

fn join_summary(previous: &str, addition: &str) -> String {
    if previous.is_empty() {
        addition.to_string()
    } else {
        format!("{previous}\n{addition}")
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// 会话初始化块：长期画像（缺失时用最近的会话洞察）+ 最近结束的会话摘要
pub async fn build_init_block(
    backends: &Backends,
    settings: &KeeperSettings,
    user_id: &str,
    session_id: &str,
) -> MemoryResult<SessionInitBlock> {
    let profile = match backends
        .fetch::<LongTermInsight>(&LongTermInsight::id_for(user_id))
        .await?
    {
        Some((longterm, _)) => Some(longterm.insight_text),
        None => {
            let recent: Vec<SessionInsight> = backends
                .query_typed(
                    &StoreQuery::new()
                        .filter("user_id", user_id)
                        .filter("insight_type", "session")
                        .order_by_desc("created_at"),
                    INIT_FALLBACK_INSIGHTS,
                )
                .await?;
            (!recent.is_empty()).then(|| {
                recent
                    .iter()
                    .map(|i| format!("- {}", i.insight_text))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    };

    let recent_summaries = if settings.recent_sessions_for_init == 0 {
        Vec::new()
    } else {
        backends
            .query_typed::<SessionSummary>(
                &StoreQuery::new()
                    .filter("user_id", user_id)
                    .filter("status", "ended")
                    .order_by_desc("end_time"),
                settings.recent_sessions_for_init + 1,
            )
            .await?
            .into_iter()
            .filter(|s| s.id != session_id)
            .take(settings.recent_sessions_for_init)
            .map(|s| RecentSummary {
                session_id: s.id,
                end_time: s.end_time,
                summary: s.summary,
            })
            .collect()
    };

    Ok(SessionInitBlock {
        profile,
        recent_summaries,
    })
}

/// 会话键下已持久化的计数器；新会话从这里继续编号
struct PersistedCounters {
    next_seq: u64,
    generation: u64,
    ended: bool,
}

async fn persisted_counters(
    backends: &Backends,
    user_id: &str,
    session_id: &str,
) -> MemoryResult<PersistedCounters> {
    let mut counters = PersistedCounters {
        next_seq: 1,
        generation: 0,
        ended: false,
    };
    if let Some((snapshot, _)) = backends
        .fetch::<SessionSnapshot>(&SessionSnapshot::id_for(user_id, session_id))
        .await?
    {
        counters.next_seq = snapshot.next_seq.max(1);
        counters.generation = snapshot.generation;
        counters.ended = snapshot.status == SessionStatus::Ended;
    }
    if let Some((summary, _)) = backends
        .fetch::<SessionSummary>(&SessionSummary::id_for(user_id, session_id))
        .await?
    {
        counters.ended |= summary.status == SessionStatus::Ended;
    }
    let latest: Vec<InteractionChunk> = backends
        .query_typed(
            &StoreQuery::new()
                .filter("user_id", user_id)
                .filter("session_id", session_id)
                .order_by_desc("generation"),
            1,
        )
        .await?;
    if let Some(chunk) = latest.first() {
        counters.generation = counters.generation.max(chunk.generation + 1);
        counters.next_seq = counters.next_seq.max(chunk.last_seq + 1);
    }
    Ok(counters)
}

/// 会话的全部 chunk，按 generation 升序
pub async fn session_chunks(
    backends: &Backends,
    user_id: &str,
    session_id: &str,
) -> MemoryResult<Vec<InteractionChunk>> {
    let mut chunks: Vec<InteractionChunk> = backends
        .query_typed(
            &StoreQuery::new()
                .filter("user_id", user_id)
                .filter("session_id", session_id)
                .order_by_desc("generation"),
            CHUNK_SCAN_LIMIT,
        )
        .await?;
    chunks.reverse();
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::prompts::PromptKind;
    use crate::store::Collection;
    use crate::testing::test_backends;
    use std::time::Duration;

    fn settings(k: usize, n: usize) -> KeeperSettings {
        KeeperSettings {
            buffer_size: k,
            retained_turns: n,
            ..KeeperSettings::default()
        }
    }

    async fn keeper(backends: Backends, k: usize, n: usize) -> MemoryKeeper {
        MemoryKeeper::create(backends, settings(k, n), "u1", "s1")
            .await
            .unwrap()
    }

    fn seqs(keeper: &MemoryKeeper) -> Vec<u64> {
        keeper.buffer().iter().map(|t| t.seq).collect()
    }

    async fn append_n(keeper: &mut MemoryKeeper, from: u64, to: u64) -> Vec<AppendOutcome> {
        let mut outcomes = Vec::new();
        for i in from..=to {
            let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
            outcomes.push(
                keeper
                    .append_turn(role, format!("turn {i} about budgeting"))
                    .await
                    .unwrap(),
            );
        }
        outcomes
    }

    #[tokio::test]
    async fn test_threshold_compaction_scenario() {
        let (backends, _, store) = test_backends();
        let mut keeper = keeper(backends.clone(), 10, 5).await;

        let outcomes = append_n(&mut keeper, 1, 10).await;
        assert_eq!(outcomes[9], AppendOutcome::Compacted { generation: 0 });
        assert!(outcomes[..9].iter().all(|o| *o == AppendOutcome::Buffered));
        assert_eq!(seqs(&keeper), vec![6, 7, 8, 9, 10]);

        let chunk: InteractionChunk = backends
            .fetch(&InteractionChunk::id_for("u1", "s1", 0))
            .await
            .unwrap()
            .unwrap()
            .0;
        assert_eq!((chunk.first_seq, chunk.last_seq), (1, 10));
        assert!(chunk.content.contains("turn 1 about"));
        assert!(!chunk.summary.is_empty());

        append_n(&mut keeper, 11, 12).await;
        assert_eq!(seqs(&keeper), vec![6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(store.inner.len(Collection::Interactions).await, 1);

        keeper.end_session(None).await.unwrap();
        assert!(keeper.buffer().is_empty());
        assert_eq!(keeper.phase(), KeeperPhase::Frozen);
        let last: InteractionChunk = backends
            .fetch(&InteractionChunk::id_for("u1", "s1", 1))
            .await
            .unwrap()
            .unwrap()
            .0;
        assert_eq!((last.first_seq, last.owned_from_seq, last.last_seq), (6, 11, 12));
        assert!(last.owned_content.contains("turn 11"));
        assert!(!last.owned_content.contains("turn 10"));
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_threshold() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends, 4, 2).await;
        for i in 1..=23u64 {
            keeper
                .append_turn(Role::User, format!("message {i}"))
                .await
                .unwrap();
            assert!(keeper.buffer().len() <= 4);
        }
        // 每次压缩后剩 2 轮，再追加 2 轮触发下一次
        assert_eq!(keeper.generation(), 10);
        assert_eq!(seqs(&keeper), vec![21, 22, 23]);
    }

    #[tokio::test]
    async fn test_failed_fold_is_retried_without_duplicate_chunk() {
        let (backends, completion, store) = test_backends();
        let mut keeper = keeper(backends, 4, 2).await;
        completion.fail_transient(PromptKind::FoldSummary, 1);

        let outcomes = append_n(&mut keeper, 1, 4).await;
        assert!(matches!(outcomes[3], AppendOutcome::CompactionDeferred { .. }));
        assert_eq!(keeper.buffer().len(), 4);
        assert_eq!(keeper.generation(), 0);
        assert_eq!(store.upserts(Collection::Interactions), 1);

        // 下一次追加先补做压缩：复用已写入的 chunk
        let outcome = keeper.append_turn(Role::User, "turn 5").await.unwrap();
        assert_eq!(outcome, AppendOutcome::Buffered);
        assert_eq!(store.upserts(Collection::Interactions), 1);
        assert_eq!(completion.calls(PromptKind::ChunkMetadata), 1);
        assert_eq!(completion.calls(PromptKind::FoldSummary), 2);
        assert_eq!(seqs(&keeper), vec![3, 4, 5]);
        assert_eq!(keeper.generation(), 1);
    }

    #[tokio::test]
    async fn test_replayed_compaction_is_idempotent() {
        let (backends, completion, store) = test_backends();
        let mut keeper = keeper(backends, 4, 2).await;
        append_n(&mut keeper, 1, 4).await;
        let summary = keeper.cumulative_summary().to_string();

        // 缓冲中已无新轮次，重放压缩无效果
        assert_eq!(keeper.compact().await.unwrap(), None);
        assert_eq!(store.upserts(Collection::Interactions), 1);
        assert_eq!(completion.calls(PromptKind::FoldSummary), 1);
        assert_eq!(keeper.cumulative_summary(), summary);
    }

    #[tokio::test]
    async fn test_store_outage_blocks_append_at_threshold() {
        let (backends, _, store) = test_backends();
        let mut keeper = keeper(backends, 3, 1).await;
        store.fail_writes(Collection::Interactions, true);
        let outcomes = append_n(&mut keeper, 1, 3).await;
        assert!(matches!(outcomes[2], AppendOutcome::CompactionDeferred { .. }));

        let err = keeper.append_turn(Role::User, "blocked").await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(keeper.buffer().len(), 3);

        store.fail_writes(Collection::Interactions, false);
        keeper.append_turn(Role::User, "accepted").await.unwrap();
        assert_eq!(seqs(&keeper), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_cumulative_summary_is_folded_forward() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends, 2, 1).await;
        keeper.append_turn(Role::User, "I like hiking").await.unwrap();
        keeper.append_turn(Role::Assistant, "Great").await.unwrap();
        let first = keeper.cumulative_summary().to_string();
        keeper.append_turn(Role::User, "Also chess").await.unwrap();
        assert!(keeper.cumulative_summary().starts_with(&first));
        assert!(keeper.cumulative_summary().contains("chess"));
    }

    #[tokio::test]
    async fn test_context_block_sections() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends, 3, 2).await;
        assert_eq!(keeper.get_context(), "");
        keeper.append_turn(Role::User, "hello there").await.unwrap();
        keeper.append_turn(Role::Assistant, "hi").await.unwrap();
        keeper.append_turn(Role::User, "how are you").await.unwrap();
        let context = keeper.get_context();
        assert!(context.contains("### Conversation Summary"));
        assert!(context.contains("### Active Conversation\nassistant: hi\nuser: how are you"));
    }

    #[tokio::test]
    async fn test_append_after_end_is_rejected() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends, 10, 5).await;
        keeper.append_turn(Role::User, "bye").await.unwrap();
        keeper.end_session(None).await.unwrap();
        let err = keeper.append_turn(Role::User, "again").await.unwrap_err();
        assert!(matches!(err, MemoryError::SessionEnded { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends.clone(), 4, 2).await;
        append_n(&mut keeper, 1, 6).await;
        keeper.persist_snapshot().await.unwrap();
        assert!(!keeper.is_dirty());

        let restored = MemoryKeeper::restore(backends, settings(4, 2), "u1", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.buffer(), keeper.buffer());
        assert_eq!(restored.cumulative_summary(), keeper.cumulative_summary());
        assert_eq!(restored.generation(), keeper.generation());
        assert!(!restored.is_dirty());
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_rebuilds_from_chunks() {
        let (backends, _, _) = test_backends();
        let mut keeper = keeper(backends.clone(), 2, 1).await;
        append_n(&mut keeper, 1, 4).await;

        let rebuilt = MemoryKeeper::restore(backends.clone(), settings(2, 1), "u1", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rebuilt.generation(), keeper.generation());
        assert!(rebuilt.buffer().is_empty());
        assert!(!rebuilt.cumulative_summary().is_empty());

        assert!(MemoryKeeper::restore(backends, settings(2, 1), "u1", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ended_snapshot_is_not_overwritten() {
        let (backends, _, _) = test_backends();
        let mut stale = keeper(backends.clone(), 10, 5).await;
        stale.append_turn(Role::User, "hi").await.unwrap();

        let mut live = MemoryKeeper::create(backends.clone(), settings(10, 5), "u1", "s1")
            .await
            .unwrap();
        live.append_turn(Role::User, "hello").await.unwrap();
        live.end_session(None).await.unwrap();

        stale.persist_snapshot().await.unwrap();
        let (snapshot, _) = backends
            .fetch::<SessionSnapshot>(&SessionSnapshot::id_for("u1", "s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, SessionStatus::Ended);
    }
    #[tokio::test]
    async fn test_fresh_session_on_used_key_keeps_new_turns() {
        let (backends, _, store) = test_backends();
        let mut old = keeper(backends.clone(), 4, 2).await;
        for i in 1..=4 {
            old.append_turn(Role::User, format!("old topic sailing {i}")).await.unwrap();
        }
        old.persist_snapshot().await.unwrap();

        let mut fresh = keeper(backends.clone(), 4, 2).await;
        assert_eq!(fresh.generation(), 1);
        assert!(fresh.buffer().is_empty());
        for i in 1..=4 {
            fresh.append_turn(Role::User, format!("new topic cooking {i}")).await.unwrap();
        }

        assert_eq!(store.upserts(Collection::Interactions), 2);
        assert_eq!(seqs(&fresh), vec![7, 8]);
        let chunks = session_chunks(&backends, "u1", "s1").await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].owned_content.contains("new topic cooking 1"));
        assert!(!chunks[1].owned_content.contains("sailing"));
        // 每一轮恰好归属一个 chunk
        for seq in 1..=8u64 {
            assert_eq!(chunks.iter().filter(|c| c.owns(seq)).count(), 1, "seq {seq}");
        }
    }

    #[tokio::test]
    async fn test_fresh_session_on_ended_key_is_rejected() {
        let (backends, _, _) = test_backends();
        let mut old = keeper(backends.clone(), 10, 5).await;
        old.append_turn(Role::User, "see you tomorrow").await.unwrap();
        old.end_session(None).await.unwrap();

        let err = MemoryKeeper::create(backends, settings(10, 5), "u1", "s1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MemoryError::SessionEnded { .. }));
    }

    #[tokio::test]
    async fn test_foreign_chunk_at_same_generation_is_a_conflict() {
        let (backends, _, store) = test_backends();
        let mut ours = keeper(backends.clone(), 4, 2).await;
        let mut other = keeper(backends.clone(), 2, 1).await;
        append_n(&mut other, 1, 2).await;

        let outcomes = append_n(&mut ours, 1, 4).await;
        match &outcomes[3] {
            AppendOutcome::CompactionDeferred { reason } => {
                assert!(reason.contains("compaction conflict"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ours.buffer().len(), 4);
        assert_eq!(ours.generation(), 0);
        assert_eq!(store.upserts(Collection::Interactions), 1);
    }

    #[tokio::test]
    async fn test_cancelled_compaction_does_not_leave_phase_stuck() {
        let (backends, completion, store) = test_backends();
        let mut keeper = keeper(backends, 4, 2).await;
        append_n(&mut keeper, 1, 3).await;

        completion.delay(PromptKind::FoldSummary, Duration::from_secs(5));
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            keeper.append_turn(Role::User, "turn 4"),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(keeper.phase(), KeeperPhase::Compacting);
        assert_eq!(keeper.buffer().len(), 4);
        assert_eq!(store.upserts(Collection::Interactions), 1);

        completion.clear_delay(PromptKind::FoldSummary);
        keeper.append_turn(Role::User, "turn 5").await.unwrap();
        assert_eq!(keeper.phase(), KeeperPhase::Accumulating);
        assert_eq!(keeper.generation(), 1);
        assert_eq!(store.upserts(Collection::Interactions), 1);
        assert_eq!(seqs(&keeper), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_end_retry_after_failed_analysis_sees_final_chunk() {
        let (backends, completion, _) = test_backends();
        let mut keeper = keeper(backends, 10, 5).await;
        keeper.append_turn(Role::User, "book the dentist for friday").await.unwrap();
        keeper.append_turn(Role::Assistant, "done").await.unwrap();

        completion.fail_transient(PromptKind::SessionAnalysis, 1);
        assert!(keeper.end_session(None).await.unwrap_err().is_retriable());
        assert_eq!(keeper.status(), SessionStatus::Active);

        keeper.end_session(None).await.unwrap();
        let input = completion.last_input(PromptKind::SessionAnalysis).unwrap();
        let final_turns = crate::memory::prompts::section(&input, "final_turns").unwrap();
        assert!(final_turns.contains("book the dentist for friday"));
        assert_eq!(keeper.status(), SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_rejected_metadata_defers_until_cleared() {
        let (backends, completion, _) = test_backends();
        let mut keeper = keeper(backends, 3, 1).await;
        completion.reject(PromptKind::ChunkMetadata);
        let outcomes = append_n(&mut keeper, 1, 3).await;
        assert!(matches!(outcomes[2], AppendOutcome::CompactionDeferred { .. }));

        let err = keeper.append_turn(Role::User, "blocked").await.unwrap_err();
        assert!(matches!(err, MemoryError::BackendRejected { .. }));

        completion.clear(PromptKind::ChunkMetadata);
        keeper.append_turn(Role::User, "accepted").await.unwrap();
        assert_eq!(keeper.generation(), 1);
        assert_eq!(seqs(&keeper), vec![3, 4]);
    }
}
