//! Pupil Screen - real-time pupil and gaze screening pipeline.
//!
//! This library ingests a live stream of camera frames tied to a stimulus
//! sequence, extracts a coarse pupil/gaze signal per frame, aggregates it per
//! stimulus into durable records, and derives a rule-based verdict from a
//! user's accumulated history.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Pupil Screen                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   Session   │──▶│  Analyzer   │──▶│ Aggregator  │       │
//! │  │ (WebSocket) │   │ (per frame) │   │(per stimulus│       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                    │              │
//! │         ▼                                    ▼              │
//! │  ┌─────────────┐                     ┌─────────────┐       │
//! │  │    Auth     │                     │   Record    │       │
//! │  │  (tokens)   │                     │   Store     │       │
//! │  └─────────────┘                     └─────────────┘       │
//! │                                             │              │
//! │                                             ▼              │
//! │                                      ┌─────────────┐       │
//! │                                      │  Decision   │       │
//! │                                      │   Engine    │       │
//! │                                      └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pupil_screen::core::{decide, FrameAnalyzer};
//! use pupil_screen::store::{RecordStore, SqliteStore};
//! use pupil_screen::UserId;
//!
//! let analyzer = FrameAnalyzer::default();
//! let sample = analyzer.analyze(&std::fs::read("frame.jpg").unwrap()).sample();
//! println!("gaze: {}", sample.gaze);
//!
//! let store = SqliteStore::open("screening.db").unwrap();
//! let verdict = decide(store.list_by_user(&UserId::new("42")).unwrap());
//! println!("{}", verdict.decision);
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod logging;
pub mod server;
pub mod session;
pub mod stats;
pub mod store;

// Re-export key types at crate root for convenience
pub use auth::{AuthError, Authenticator, TokenRegistry};
pub use config::{Config, LoggingConfig, ServerSettings};
pub use core::{
    decide, AsdFlag, FrameAnalyzer, FrameSample, GazeClass, ScreeningRecord, ScreeningVerdict,
    StimulusAggregator, UserId, Verdict,
};
pub use session::{run_session, FrameTransport, SessionContext, SessionReport};
pub use stats::{PipelineStats, SharedPipelineStats, StatsSnapshot};
pub use store::{MemoryStore, RecordStore, SqliteStore, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Notice shown wherever a verdict is displayed.
pub const SCREENING_DISCLAIMER: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║                 PUPIL SCREEN - SCREENING NOTICE                  ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This tool produces heuristic screening signals only.            ║
║                                                                  ║
║  ✓ WHAT IT MEASURES:                                             ║
║    • Size of dark, pupil-like regions in each camera frame       ║
║    • Size asymmetry between the two regions found (gaze proxy)   ║
║    • Averages of both per stimulus shown                         ║
║                                                                  ║
║  ✗ WHAT IT IS NOT:                                               ║
║    • A clinically validated diagnostic algorithm                 ║
║    • A geometric gaze tracker                                    ║
║    • A substitute for assessment by a qualified professional     ║
║                                                                  ║
║  Camera frames are analyzed in memory and discarded; only        ║
║  per-stimulus averages are stored.                               ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
