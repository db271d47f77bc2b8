//! Session description parsing, validation and repair
//!
//! Cameras behind some gateways answer with structurally broken SDP:
//! media sections without `a=mid`, `a=group:BUNDLE` lines naming mids that
//! do not exist, or no media section at all. The webrtc stack rejects such
//! answers outright, so every answer goes through [`SdpNegotiator::repair_answer`]
//! before it is applied.
//!
//! Repair order for an answer:
//! 1. no `m=` line: rebuild one video section from the session preamble
//!    (or fail with [`AppError::NoMediaSection`])
//! 2. collect the declared mids
//! 3. give every section without (or with a conflicting) mid one derived
//!    from its position
//! 4. drop unknown mids from the BUNDLE group, falling back to all mids,
//!    or remove the group when nothing is left
//! 5. synthesize a BUNDLE group when none exists
//!
//! The result is re-parsed and re-validated; any residual defect is an error.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, error, info, warn};

use super::config::VideoCodec;
use crate::error::{AppError, Result};

const BUNDLE_PREFIX: &str = "a=group:BUNDLE";
const MID_PREFIX: &str = "a=mid:";
const MSID_SEMANTIC_PREFIX: &str = "a=msid-semantic";
const DIRECTIONS: [&str; 4] = ["sendrecv", "sendonly", "recvonly", "inactive"];

/// Payload type used for the synthesized video codec
const SYNTH_PAYLOAD_TYPE: u8 = 96;

/// One `m=` section with its attribute lines, in original order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    lines: Vec<String>,
}

/// Codec entry from an `a=rtpmap` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
}

impl MediaSection {
    fn new(media_line: String) -> Self {
        Self {
            lines: vec![media_line],
        }
    }

    /// The `m=` line
    pub fn media_line(&self) -> &str {
        &self.lines[0]
    }

    /// Media kind (`video`, `audio`, `application`)
    pub fn kind(&self) -> &str {
        self.media_line()
            .trim_start_matches("m=")
            .split_whitespace()
            .next()
            .unwrap_or("")
    }

    /// All declared mids (more than one is a defect)
    ///
    /// Only single non-empty tokens count; `a=mid:` or `a=mid:video 0` is
    /// treated as no mid at all.
    pub fn mids(&self) -> Vec<&str> {
        self.mid_values().into_iter().filter(|v| is_mid_token(v)).collect()
    }

    /// Every `a=mid` value as written, malformed ones included
    fn mid_values(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix(MID_PREFIX))
            .map(str::trim)
            .collect()
    }

    /// First declared mid
    pub fn mid(&self) -> Option<&str> {
        self.mids().into_iter().next()
    }

    /// Declared direction attribute, if any
    pub fn direction(&self) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix("a="))
            .find(|a| DIRECTIONS.contains(a))
    }

    /// Codecs from `a=rtpmap` lines
    pub fn codecs(&self) -> Vec<Codec> {
        self.lines
            .iter()
            .filter_map(|l| l.strip_prefix("a=rtpmap:"))
            .filter_map(|rest| {
                let (pt, encoding) = rest.split_once(' ')?;
                let mut parts = encoding.split('/');
                let name = parts.next()?.to_string();
                let clock_rate = parts.next()?.parse().ok()?;
                Some(Codec {
                    payload_type: pt.trim().parse().ok()?,
                    name,
                    clock_rate,
                })
            })
            .collect()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Replace every `a=mid` line with a single one
    fn set_mid(&mut self, mid: &str) {
        let position = self
            .lines
            .iter()
            .position(|l| l.starts_with(MID_PREFIX))
            .or_else(|| self.lines.iter().skip(1).position(|l| l.starts_with("a=")).map(|p| p + 1))
            .unwrap_or(self.lines.len());
        self.lines.retain(|l| !l.starts_with(MID_PREFIX));
        let position = position.min(self.lines.len());
        self.lines.insert(position, format!("{}{}", MID_PREFIX, mid));
    }
}

/// Structured session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    session: Vec<String>,
    media: Vec<MediaSection>,
}

/// Structural defect found by [`SessionDescription::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpDefect {
    NoMediaSection,
    MissingMid { index: usize },
    DuplicateMid { index: usize },
    ConflictingMid { index: usize, mid: String },
    MissingBundleGroup,
    EmptyBundleGroup,
    UnknownBundleMid { mid: String },
    DuplicateBundleMid { mid: String },
}

impl fmt::Display for SdpDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpDefect::NoMediaSection => write!(f, "no media section"),
            SdpDefect::MissingMid { index } => write!(f, "media section {} has no mid", index),
            SdpDefect::DuplicateMid { index } => {
                write!(f, "media section {} declares more than one mid", index)
            }
            SdpDefect::ConflictingMid { index, mid } => {
                write!(f, "media section {} reuses mid '{}'", index, mid)
            }
            SdpDefect::MissingBundleGroup => write!(f, "no BUNDLE group"),
            SdpDefect::EmptyBundleGroup => write!(f, "empty BUNDLE group"),
            SdpDefect::UnknownBundleMid { mid } => {
                write!(f, "BUNDLE references unknown mid '{}'", mid)
            }
            SdpDefect::DuplicateBundleMid { mid } => {
                write!(f, "BUNDLE lists mid '{}' twice", mid)
            }
        }
    }
}

impl SessionDescription {
    /// Parse SDP text (CRLF or LF line endings)
    pub fn parse(raw: &str) -> Self {
        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                debug!("Skipping malformed SDP line: {}", line);
                continue;
            }
            if line.starts_with("m=") {
                media.push(MediaSection::new(line.to_string()));
            } else if let Some(section) = media.last_mut() {
                section.lines.push(line.to_string());
            } else {
                session.push(line.to_string());
            }
        }

        Self { session, media }
    }

    pub fn media_sections(&self) -> &[MediaSection] {
        &self.media
    }

    pub fn session_lines(&self) -> &[String] {
        &self.session
    }

    /// Mids of all sections, in section order
    pub fn mids(&self) -> Vec<&str> {
        self.media.iter().filter_map(MediaSection::mid).collect()
    }

    /// Mids listed by `a=group:BUNDLE`, or `None` without a group line
    pub fn bundle_group(&self) -> Option<Vec<String>> {
        self.session
            .iter()
            .find_map(|l| l.strip_prefix(BUNDLE_PREFIX))
            .map(|rest| rest.split_whitespace().map(String::from).collect())
    }

    /// Whether `mid` is part of the BUNDLE group
    pub fn is_bundled(&self, mid: &str) -> bool {
        self.bundle_group()
            .map(|group| group.iter().any(|m| m == mid))
            .unwrap_or(false)
    }

    /// Session preamble carries the mandatory version and origin lines
    pub fn has_valid_preamble(&self) -> bool {
        self.session.iter().any(|l| l.starts_with("v="))
            && self.session.iter().any(|l| l.starts_with("o="))
    }

    fn has_session_attribute(&self, prefix: &str) -> bool {
        self.session.iter().any(|l| l.starts_with(prefix))
    }

    fn set_bundle_group(&mut self, mids: Option<&[String]>) {
        let existing = self.session.iter().position(|l| l.starts_with(BUNDLE_PREFIX));
        self.session.retain(|l| !l.starts_with(BUNDLE_PREFIX));

        if let Some(mids) = mids {
            let line = format!("{} {}", BUNDLE_PREFIX, mids.join(" "));
            let position = existing
                .or_else(|| self.session.iter().position(|l| l.starts_with("a=")))
                .unwrap_or(self.session.len())
                .min(self.session.len());
            self.session.insert(position, line);
        }
    }

    /// Drop BUNDLE and msid-semantic lines; returns how many lines were removed
    pub fn strip_grouping(&mut self) -> usize {
        let before = self.session.len();
        self.session
            .retain(|l| !l.starts_with(BUNDLE_PREFIX) && !l.starts_with(MSID_SEMANTIC_PREFIX));
        before - self.session.len()
    }

    /// List every structural defect
    pub fn validate(&self) -> Vec<SdpDefect> {
        if self.media.is_empty() {
            return vec![SdpDefect::NoMediaSection];
        }

        let mut defects = Vec::new();
        let mut seen = HashSet::new();
        for (index, section) in self.media.iter().enumerate() {
            let mids = section.mids();
            match (mids.len(), section.mid_values().len()) {
                (0, _) => defects.push(SdpDefect::MissingMid { index }),
                (_, 1) => {}
                _ => defects.push(SdpDefect::DuplicateMid { index }),
            }
            if let Some(mid) = mids.first() {
                if !seen.insert(*mid) {
                    defects.push(SdpDefect::ConflictingMid {
                        index,
                        mid: mid.to_string(),
                    });
                }
            }
        }

        match self.bundle_group() {
            None if !seen.is_empty() => defects.push(SdpDefect::MissingBundleGroup),
            None => {}
            Some(group) if group.is_empty() => defects.push(SdpDefect::EmptyBundleGroup),
            Some(group) => {
                let mut listed = HashSet::new();
                for mid in group {
                    if !seen.contains(mid.as_str()) {
                        defects.push(SdpDefect::UnknownBundleMid { mid });
                    } else if !listed.insert(mid.clone()) {
                        defects.push(SdpDefect::DuplicateBundleMid { mid });
                    }
                }
            }
        }

        defects
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session {
            write!(f, "{}\r\n", line)?;
        }
        for section in &self.media {
            for line in &section.lines {
                write!(f, "{}\r\n", line)?;
            }
        }
        Ok(())
    }
}

/// One mutation applied during repair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpRepair {
    SynthesizedMediaSection { mid: String },
    DroppedExtraMids { index: usize, kept: String },
    SynthesizedMid { index: usize, mid: String },
    ReassignedMid { index: usize, from: String, to: String },
    RewroteBundle { from: Vec<String>, to: Vec<String> },
    RemovedBundle { from: Vec<String> },
    SynthesizedBundle { mids: Vec<String> },
}

impl fmt::Display for SdpRepair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpRepair::SynthesizedMediaSection { mid } => {
                write!(f, "synthesized video media section (mid {})", mid)
            }
            SdpRepair::DroppedExtraMids { index, kept } => {
                write!(f, "media section {}: kept mid '{}', dropped extras", index, kept)
            }
            SdpRepair::SynthesizedMid { index, mid } => {
                write!(f, "media section {}: synthesized mid '{}'", index, mid)
            }
            SdpRepair::ReassignedMid { index, from, to } => {
                write!(f, "media section {}: reassigned mid '{}' -> '{}'", index, from, to)
            }
            SdpRepair::RewroteBundle { from, to } => {
                write!(f, "BUNDLE rewritten [{}] -> [{}]", from.join(" "), to.join(" "))
            }
            SdpRepair::RemovedBundle { from } => {
                write!(f, "BUNDLE [{}] removed", from.join(" "))
            }
            SdpRepair::SynthesizedBundle { mids } => {
                write!(f, "BUNDLE [{}] synthesized", mids.join(" "))
            }
        }
    }
}

/// What the local offer must ask for
#[derive(Debug, Clone)]
pub struct OfferConstraints {
    pub receive_video: bool,
    pub receive_audio: bool,
    pub codec: VideoCodec,
}

impl Default for OfferConstraints {
    fn default() -> Self {
        Self {
            receive_video: true,
            receive_audio: false,
            codec: VideoCodec::H264,
        }
    }
}

/// Local offer ready to be sent
#[derive(Debug, Clone)]
pub struct OfferOutcome {
    pub description: SessionDescription,
    /// The generated offer was empty and a media section was synthesized
    pub synthesized: bool,
}

/// Repaired remote answer
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub description: SessionDescription,
    pub repairs: Vec<SdpRepair>,
}

impl RepairOutcome {
    pub fn was_repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Builds local offers and repairs remote answers
#[derive(Debug, Clone, Default)]
pub struct SdpNegotiator {
    codec: VideoCodec,
}

impl SdpNegotiator {
    pub fn new(codec: VideoCodec) -> Self {
        Self { codec }
    }

    /// Turn the stack-generated offer into the one sent to the server
    pub fn build_offer(&self, raw: &str, constraints: &OfferConstraints) -> Result<OfferOutcome> {
        let mut description = SessionDescription::parse(raw);

        if !description.media_sections().is_empty() {
            let defects = description.validate();
            if !defects.is_empty() {
                debug!("Local offer has defects: {:?}", defects);
            }
            return Ok(OfferOutcome {
                description,
                synthesized: false,
            });
        }

        if !constraints.receive_video {
            return Err(AppError::Negotiation(
                "generated offer has no media section and video is not requested".into(),
            ));
        }

        if !description.has_valid_preamble() {
            description.session = default_preamble();
        }
        let section = synthesize_video_section(&description, "0", constraints.codec);
        description.media.push(section);
        description.set_bundle_group(Some(&["0".to_string()]));

        warn!(
            codec = %constraints.codec,
            "Generated offer had no media section, synthesized a recvonly video section"
        );

        Ok(OfferOutcome {
            description,
            synthesized: true,
        })
    }

    /// Validate and repair a remote answer
    pub fn repair_answer(&self, raw: &str) -> Result<RepairOutcome> {
        let mut desc = SessionDescription::parse(raw);
        let mut repairs = Vec::new();

        // 1. Media section must exist
        if desc.media.is_empty() {
            if !desc.has_valid_preamble() {
                error!("Answer has no media section and no usable session preamble");
                return Err(AppError::NoMediaSection);
            }
            let section = synthesize_video_section(&desc, "0", self.codec);
            desc.media.push(section);
            let repair = SdpRepair::SynthesizedMediaSection {
                mid: "0".to_string(),
            };
            warn!("Answer repair: {}", repair);
            repairs.push(repair);
        }

        // 2. Collect declared mids
        for (index, section) in desc.media.iter_mut().enumerate() {
            if section.mid_values().len() < 2 {
                continue;
            }
            if let Some(kept) = section.mid().map(String::from) {
                section.set_mid(&kept);
                let repair = SdpRepair::DroppedExtraMids { index, kept };
                info!("Answer repair: {}", repair);
                repairs.push(repair);
            }
        }
        // Malformed values only survive here when a section has no usable mid
        let declared: Vec<Option<String>> = desc
            .media
            .iter()
            .map(|s| {
                s.mid()
                    .or_else(|| s.mid_values().into_iter().next())
                    .map(String::from)
            })
            .collect();
        let mut taken: HashSet<String> = declared
            .iter()
            .flatten()
            .filter(|m| is_mid_token(m))
            .cloned()
            .collect();

        // 3. Positional mids for sections lacking one
        let mut seen = HashSet::new();
        for (index, declared_mid) in declared.into_iter().enumerate() {
            if let Some(mid) = declared_mid.as_deref().filter(|m| is_mid_token(m)) {
                if seen.insert(mid.to_string()) {
                    continue;
                }
            }
            let mid = positional_mid(index, &taken);
            let repair = match declared_mid {
                Some(from) => SdpRepair::ReassignedMid {
                    index,
                    from,
                    to: mid.clone(),
                },
                None => SdpRepair::SynthesizedMid {
                    index,
                    mid: mid.clone(),
                },
            };
            desc.media[index].set_mid(&mid);
            taken.insert(mid.clone());
            seen.insert(mid);
            info!("Answer repair: {}", repair);
            repairs.push(repair);
        }

        let all_mids: Vec<String> = desc.mids().into_iter().map(String::from).collect();

        // 4./5. BUNDLE group
        match desc.bundle_group() {
            Some(group) => {
                let mut valid: Vec<String> = Vec::new();
                for mid in &group {
                    if all_mids.contains(mid) && !valid.contains(mid) {
                        valid.push(mid.clone());
                    }
                }
                if group.is_empty() || valid.len() != group.len() {
                    let repair = if !valid.is_empty() {
                        desc.set_bundle_group(Some(&valid));
                        SdpRepair::RewroteBundle {
                            from: group,
                            to: valid,
                        }
                    } else if !all_mids.is_empty() {
                        desc.set_bundle_group(Some(&all_mids));
                        SdpRepair::RewroteBundle {
                            from: group,
                            to: all_mids.clone(),
                        }
                    } else {
                        desc.set_bundle_group(None);
                        SdpRepair::RemovedBundle { from: group }
                    };
                    info!("Answer repair: {}", repair);
                    repairs.push(repair);
                }
            }
            None if !all_mids.is_empty() => {
                desc.set_bundle_group(Some(&all_mids));
                let repair = SdpRepair::SynthesizedBundle {
                    mids: all_mids.clone(),
                };
                info!("Answer repair: {}", repair);
                repairs.push(repair);
            }
            None => {}
        }

        // Round trip through the validator
        let description = SessionDescription::parse(&desc.to_string());
        let defects = description.validate();
        if !defects.is_empty() {
            let summary = defects
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            error!("Answer still invalid after repair: {}", summary);
            return Err(AppError::SdpRepair(summary));
        }

        Ok(RepairOutcome {
            description,
            repairs,
        })
    }
}

/// A usable mid: one non-empty token
fn is_mid_token(value: &str) -> bool {
    !value.is_empty() && !value.contains(char::is_whitespace)
}

/// Mid derived from the section position, unique against `taken`
fn positional_mid(index: usize, taken: &HashSet<String>) -> String {
    let plain = index.to_string();
    if !taken.contains(&plain) {
        return plain;
    }
    let prefixed = format!("m{}", index);
    if !taken.contains(&prefixed) {
        return prefixed;
    }
    (1..)
        .map(|n| format!("m{}-{}", index, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(prefixed)
}

fn default_preamble() -> Vec<String> {
    let session_id = uuid::Uuid::new_v4().as_u128() as u64 >> 1;
    vec![
        "v=0".to_string(),
        format!("o=- {} 2 IN IP4 127.0.0.1", session_id),
        "s=-".to_string(),
        "t=0 0".to_string(),
    ]
}

/// Minimal receive-only video section with one codec and ICE placeholders
fn synthesize_video_section(desc: &SessionDescription, mid: &str, codec: VideoCodec) -> MediaSection {
    let pt = SYNTH_PAYLOAD_TYPE;
    let mut section = MediaSection::new(format!("m=video 9 UDP/TLS/RTP/SAVPF {}", pt));
    section.lines.push("c=IN IP4 0.0.0.0".to_string());

    if !desc.has_session_attribute("a=ice-ufrag:") {
        let token = uuid::Uuid::new_v4().simple().to_string();
        section.lines.push(format!("a=ice-ufrag:{}", &token[..8]));
        section.lines.push(format!("a=ice-pwd:{}", &token[8..]));
    }
    section.lines.push(format!("{}{}", MID_PREFIX, mid));
    section.lines.push("a=recvonly".to_string());
    section.lines.push("a=rtcp-mux".to_string());
    section
        .lines
        .push(format!("a=rtpmap:{} {}/90000", pt, codec.encoding_name()));
    if let Some(fmtp) = codec.fmtp() {
        section.lines.push(format!("a=fmtp:{} {}", pt, fmtp));
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VALID_ANSWER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0 1\r\n\
        a=msid-semantic: WMS\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:abcd\r\n\
        a=ice-pwd:abcdefghijklmnopqrstuvwx\r\n\
        a=mid:0\r\n\
        a=sendonly\r\n\
        a=rtpmap:96 H264/90000\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n\
        a=rtpmap:111 opus/48000/2\r\n";

    fn negotiator() -> SdpNegotiator {
        SdpNegotiator::new(VideoCodec::H264)
    }

    #[test]
    fn test_parse_sections() {
        let desc = SessionDescription::parse(VALID_ANSWER);
        assert_eq!(desc.media_sections().len(), 2);
        let video = &desc.media_sections()[0];
        assert_eq!(video.kind(), "video");
        assert_eq!(video.mid(), Some("0"));
        assert_eq!(video.direction(), Some("sendonly"));
        assert_eq!(
            video.codecs(),
            vec![Codec {
                payload_type: 96,
                name: "H264".into(),
                clock_rate: 90000
            }]
        );
        assert_eq!(desc.bundle_group(), Some(vec!["0".into(), "1".into()]));
        assert!(desc.is_bundled("1"));
        assert!(desc.validate().is_empty());
    }

    #[test]
    fn test_lf_input_is_normalized() {
        let lf = VALID_ANSWER.replace("\r\n", "\n");
        let desc = SessionDescription::parse(&lf);
        assert_eq!(desc.to_string(), VALID_ANSWER);
    }

    #[test]
    fn test_valid_answer_is_unchanged() {
        let outcome = negotiator().repair_answer(VALID_ANSWER).unwrap();
        assert!(!outcome.was_repaired());
        assert_eq!(outcome.description.to_string(), VALID_ANSWER);
    }

    #[test]
    fn test_missing_mid_is_synthesized_from_position() {
        let raw = VALID_ANSWER.replace("a=mid:1\r\n", "");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        let desc = &outcome.description;
        assert_eq!(desc.mids(), vec!["0", "1"]);
        assert!(outcome.repairs.contains(&SdpRepair::SynthesizedMid {
            index: 1,
            mid: "1".into()
        }));
        assert_eq!(desc.bundle_group(), Some(vec!["0".into(), "1".into()]));
    }

    #[test]
    fn test_positional_mid_avoids_collision() {
        // Section 0 lacks a mid while section 1 already uses "0"
        let raw = VALID_ANSWER
            .replace("a=mid:0\r\n", "")
            .replace("a=mid:1\r\n", "a=mid:0\r\n")
            .replace("a=group:BUNDLE 0 1", "a=group:BUNDLE 0");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        assert_eq!(outcome.description.mids(), vec!["m0", "0"]);
        assert!(outcome.description.validate().is_empty());
    }

    #[test]
    fn test_bundle_unknown_mids_are_dropped() {
        let raw = VALID_ANSWER.replace("a=group:BUNDLE 0 1", "a=group:BUNDLE 0 video 7");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        assert_eq!(outcome.description.bundle_group(), Some(vec!["0".into()]));
        assert!(matches!(
            outcome.repairs.as_slice(),
            [SdpRepair::RewroteBundle { .. }]
        ));
    }

    #[test]
    fn test_bundle_with_no_valid_mid_lists_all() {
        let raw = VALID_ANSWER.replace("a=group:BUNDLE 0 1", "a=group:BUNDLE audio video");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        assert_eq!(
            outcome.description.bundle_group(),
            Some(vec!["0".into(), "1".into()])
        );
    }

    #[test]
    fn test_missing_bundle_is_synthesized() {
        let raw = VALID_ANSWER.replace("a=group:BUNDLE 0 1\r\n", "");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        assert_eq!(
            outcome.repairs,
            vec![SdpRepair::SynthesizedBundle {
                mids: vec!["0".into(), "1".into()]
            }]
        );
        // Group line goes back into the session preamble before other attributes
        let session = outcome.description.session_lines();
        assert_eq!(session[4], "a=group:BUNDLE 0 1");
    }

    #[test]
    fn test_duplicate_mids_in_one_section() {
        let raw = VALID_ANSWER.replace("a=mid:0\r\n", "a=mid:0\r\na=mid:video\r\n");
        let desc = SessionDescription::parse(&raw);
        assert_eq!(desc.validate(), vec![SdpDefect::DuplicateMid { index: 0 }]);

        let outcome = negotiator().repair_answer(&raw).unwrap();
        assert_eq!(outcome.description.media_sections()[0].mids(), vec!["0"]);
    }

    #[test]
    fn test_empty_mid_is_reassigned() {
        let raw = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:\r\na=recvonly\r\n";
        assert_eq!(
            SessionDescription::parse(raw).validate(),
            vec![SdpDefect::MissingMid { index: 0 }]
        );

        let outcome = negotiator().repair_answer(raw).unwrap();
        let desc = &outcome.description;
        assert_eq!(desc.mids(), vec!["0"]);
        assert_eq!(desc.bundle_group(), Some(vec!["0".into()]));
        assert!(outcome.repairs.contains(&SdpRepair::ReassignedMid {
            index: 0,
            from: String::new(),
            to: "0".into()
        }));
        let mid_lines = desc.media_sections()[0]
            .lines()
            .iter()
            .filter(|l| l.starts_with("a=mid:"))
            .count();
        assert_eq!(mid_lines, 1);
    }

    #[test]
    fn test_spaced_mid_is_reassigned() {
        let raw = VALID_ANSWER
            .replace("a=mid:0\r\n", "a=mid:video 0\r\n")
            .replace("a=group:BUNDLE 0 1", "a=group:BUNDLE 1");
        let outcome = negotiator().repair_answer(&raw).unwrap();
        let desc = &outcome.description;
        assert_eq!(desc.mids(), vec!["0", "1"]);
        assert!(desc.validate().is_empty());
        assert!(outcome.repairs.contains(&SdpRepair::ReassignedMid {
            index: 0,
            from: "video 0".into(),
            to: "0".into()
        }));
        assert!(!desc.to_string().contains("video 0"));
    }

    #[test]
    fn test_answer_without_media_rebuilt_from_preamble() {
        let raw = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n";
        let outcome = negotiator().repair_answer(raw).unwrap();
        let desc = &outcome.description;
        assert_eq!(desc.media_sections().len(), 1);
        let section = &desc.media_sections()[0];
        assert_eq!(section.kind(), "video");
        assert_eq!(section.direction(), Some("recvonly"));
        assert_eq!(section.mid(), Some("0"));
        assert_eq!(section.codecs().len(), 1);
        assert!(section.lines().iter().any(|l| l.starts_with("a=ice-ufrag:")));
        assert_eq!(
            outcome.repairs[0],
            SdpRepair::SynthesizedMediaSection { mid: "0".into() }
        );
        assert!(desc.validate().is_empty());
    }

    #[test]
    fn test_answer_without_media_or_preamble_fails() {
        let err = negotiator().repair_answer("a=group:BUNDLE 0\r\n").unwrap_err();
        assert!(matches!(err, AppError::NoMediaSection));
        assert!(err.is_terminal_for_attempt());
    }

    #[test]
    fn test_strip_grouping() {
        let mut desc = SessionDescription::parse(VALID_ANSWER);
        assert_eq!(desc.strip_grouping(), 2);
        assert_eq!(desc.bundle_group(), None);
        assert!(!desc.to_string().contains("msid-semantic"));
    }

    #[test]
    fn test_offer_passthrough() {
        let constraints = OfferConstraints::default();
        let outcome = negotiator().build_offer(VALID_ANSWER, &constraints).unwrap();
        assert!(!outcome.synthesized);
        assert_eq!(outcome.description.to_string(), VALID_ANSWER);
    }

    #[test]
    fn test_empty_offer_is_synthesized() {
        let raw = "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let constraints = OfferConstraints {
            codec: VideoCodec::VP8,
            ..Default::default()
        };
        let outcome = negotiator().build_offer(raw, &constraints).unwrap();
        assert!(outcome.synthesized);
        let section = &outcome.description.media_sections()[0];
        assert_eq!(section.direction(), Some("recvonly"));
        assert_eq!(section.codecs()[0].name, "VP8");
        assert!(outcome.description.validate().is_empty());

        // Completely empty text still yields a usable offer
        let outcome = negotiator().build_offer("", &constraints).unwrap();
        assert!(outcome.description.has_valid_preamble());
        assert!(outcome.description.validate().is_empty());
    }

    #[test]
    fn test_empty_offer_without_video_is_an_error() {
        let constraints = OfferConstraints {
            receive_video: false,
            receive_audio: true,
            ..Default::default()
        };
        assert!(matches!(
            negotiator().build_offer("v=0\r\n", &constraints),
            Err(AppError::Negotiation(_))
        ));
    }

    fn build_sdp(sections: &[(Option<String>, bool)], bundle: &Option<Vec<String>>) -> String {
        let mut sdp = String::from("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        if let Some(group) = bundle {
            sdp.push_str(&format!("a=group:BUNDLE {}\r\n", group.join(" ")));
        }
        for (i, (mid, extra_mid)) in sections.iter().enumerate() {
            sdp.push_str(&format!("m=video 9 UDP/TLS/RTP/SAVPF {}\r\n", 96 + i));
            sdp.push_str("c=IN IP4 0.0.0.0\r\n");
            if let Some(mid) = mid {
                sdp.push_str(&format!("a=mid:{}\r\n", mid));
            }
            if *extra_mid {
                sdp.push_str("a=mid:extra\r\n");
            }
            sdp.push_str("a=recvonly\r\n");
        }
        sdp
    }

    fn mid_token() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u8..6).prop_map(|n| n.to_string()),
            Just("video".to_string()),
            Just("m1".to_string()),
            Just(String::new()),
            Just("video 0".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn prop_repair_restores_invariants(
            sections in prop::collection::vec((prop::option::of(mid_token()), any::<bool>()), 1..5),
            bundle in prop::option::of(prop::collection::vec(mid_token(), 0..5)),
        ) {
            let raw = build_sdp(&sections, &bundle);
            let outcome = negotiator().repair_answer(&raw).unwrap();
            let desc = &outcome.description;

            prop_assert!(desc.validate().is_empty());
            for section in desc.media_sections() {
                prop_assert_eq!(section.mids().len(), 1);
            }
            let mids: Vec<&str> = desc.mids();
            if let Some(group) = desc.bundle_group() {
                for mid in &group {
                    prop_assert!(mids.contains(&mid.as_str()));
                }
            }

            // Repair is idempotent
            let again = negotiator().repair_answer(&desc.to_string()).unwrap();
            prop_assert!(again.repairs.is_empty());
            prop_assert_eq!(&again.description, desc);
        }
    }
}
