//! Detector configuration format.

use crate::{common::*, error::DetectorError};

pub use anchor::*;
pub use block_mix::*;
pub use mode::*;
pub use pooling::*;
pub use rcnn::*;
pub use rpn::*;

/// The main detector configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub anchors: AnchorConfig,
    pub rpn: RpnConfig,
    pub rcnn: RcnnConfig,
    pub pooling: PoolingConfig,
    /// The proposal selection at test time.
    pub proposal_mode: ProposalMode,
    pub training_mode: TrainingModeConfig,
    pub block_mix: BlockMixConfig,
    /// Seed of the random generator owned by the detector.
    pub seed: u64,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        Self::from_json5_str(&text)
    }

    /// Parse and validate a JSON5 configuration text.
    pub fn from_json5_str(text: &str) -> Result<Self> {
        // mode names are parsed ahead, so that unknown names keep their error kind
        let ModeNames {
            pooling,
            proposal_mode,
        } = json5::from_str(text)?;
        if let Some(mode) = pooling.mode {
            mode.parse::<PoolingMode>()?;
        }
        if let Some(mode) = proposal_mode {
            mode.parse::<ProposalMode>()?;
        }

        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The training mode resolved from the mode name or the legacy flags.
    pub fn training_mode(&self) -> Result<TrainingMode> {
        self.training_mode.resolve()
    }

    /// Check the value ranges and the compatibility of the settings.
    pub fn validate(&self) -> Result<()> {
        let Self {
            anchors,
            rpn,
            rcnn,
            pooling,
            block_mix,
            ..
        } = self;

        self.training_mode()?;

        // anchors
        ensure!(
            anchors.feat_stride > 0,
            DetectorError::config("anchors.feat_stride must be positive")
        );
        ensure!(
            !anchors.scales.is_empty() && anchors.scales.iter().all(|&s| s > 0.0),
            DetectorError::config("anchors.scales must be non-empty and positive")
        );
        ensure!(
            !anchors.ratios.is_empty() && anchors.ratios.iter().all(|&r| r > 0.0),
            DetectorError::config("anchors.ratios must be non-empty and positive")
        );

        // rpn
        ensure!(
            rpn.channels > 0,
            DetectorError::config("rpn.channels must be positive")
        );
        ensure!(
            rpn.sigma > 0.0,
            DetectorError::config("rpn.sigma must be positive")
        );
        ensure!(
            is_unit(rpn.positive_overlap) && is_unit(rpn.negative_overlap),
            DetectorError::config("rpn overlap thresholds must be in range [0, 1]")
        );
        ensure!(
            rpn.batch_size > 0,
            DetectorError::config("rpn.batch_size must be positive")
        );
        ensure!(
            is_unit(rpn.fg_fraction),
            DetectorError::config("rpn.fg_fraction must be in range [0, 1]")
        );
        ensure!(
            rpn.positive_weight < 0.0 || (rpn.positive_weight > 0.0 && rpn.positive_weight < 1.0),
            DetectorError::config("rpn.positive_weight must be negative or in range (0, 1)")
        );
        ensure!(
            rpn.train.pre_nms_top_n > 0
                && rpn.train.post_nms_top_n > 0
                && rpn.test.pre_nms_top_n > 0
                && rpn.test.post_nms_top_n > 0
                && rpn.test.top_n > 0,
            DetectorError::config("rpn proposal counts must be positive")
        );
        ensure!(
            is_unit(rpn.train.nms_threshold) && is_unit(rpn.test.nms_threshold),
            DetectorError::config("rpn nms thresholds must be in range [0, 1]")
        );
        ensure!(
            rpn.train.min_size >= 0.0 && rpn.test.min_size >= 0.0,
            DetectorError::config("rpn min_size must be non-negative")
        );

        // rcnn
        ensure!(
            rcnn.batch_size > 0,
            DetectorError::config("rcnn.batch_size must be positive")
        );
        ensure!(
            is_unit(rcnn.fg_fraction) && is_unit(rcnn.fg_threshold),
            DetectorError::config("rcnn.fg_fraction and rcnn.fg_threshold must be in range [0, 1]")
        );
        ensure!(
            rcnn.bg_threshold_lo >= 0.0 && rcnn.bg_threshold_lo <= rcnn.bg_threshold_hi,
            DetectorError::config("rcnn background range must satisfy 0 <= lo <= hi")
        );
        ensure!(
            rcnn.sigma > 0.0,
            DetectorError::config("rcnn.sigma must be positive")
        );
        ensure!(
            rcnn.bbox_normalize_stds.iter().all(|&s| s > 0.0),
            DetectorError::config("rcnn.bbox_normalize_stds must be positive")
        );

        // pooling
        ensure!(
            pooling.size > 0,
            DetectorError::config("pooling.size must be positive")
        );

        // block mix
        ensure!(
            is_unit(block_mix.drop_prob),
            DetectorError::config("block_mix.drop_prob must be in range [0, 1]")
        );
        ensure!(
            block_mix.block_size > 0,
            DetectorError::config("block_mix.block_size must be positive")
        );
        ensure!(
            block_mix.mixup_alpha > 0.0,
            DetectorError::config("block_mix.mixup_alpha must be positive")
        );

        Ok(())
    }
}

/// The mode names of a configuration text before they are parsed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModeNames {
    pooling: PoolingModeName,
    proposal_mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolingModeName {
    mode: Option<String>,
}

fn is_unit(value: R64) -> bool {
    (0.0..=1.0).contains(&value.raw())
}

mod anchor {
    use super::*;

    /// Anchor layout on the feature map.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AnchorConfig {
        /// Pixel distance between neighboring feature cells.
        pub feat_stride: i64,
        pub scales: Vec<f64>,
        /// Height to width ratios.
        pub ratios: Vec<f64>,
    }

    impl Default for AnchorConfig {
        fn default() -> Self {
            Self {
                feat_stride: 16,
                scales: vec![8.0, 16.0, 32.0],
                ratios: vec![0.5, 1.0, 2.0],
            }
        }
    }

    impl AnchorConfig {
        pub fn num_anchors(&self) -> usize {
            self.scales.len() * self.ratios.len()
        }
    }
}

mod rpn {
    use super::*;

    /// Region proposal network options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RpnConfig {
        /// Channels of the intermediate 3x3 convolution.
        pub channels: i64,
        pub sigma: R64,
        pub positive_overlap: R64,
        pub negative_overlap: R64,
        /// Let the negative labelling override positives.
        pub clobber_positives: bool,
        pub batch_size: usize,
        pub fg_fraction: R64,
        /// Weight of positive examples, or a negative value for uniform weighting.
        pub positive_weight: R64,
        /// Distance that anchors may cross the image border.
        pub allowed_border: R64,
        pub train: TrainProposalConfig,
        pub test: TestProposalConfig,
    }

    impl Default for RpnConfig {
        fn default() -> Self {
            Self {
                channels: 512,
                sigma: r64(3.0),
                positive_overlap: r64(0.7),
                negative_overlap: r64(0.3),
                clobber_positives: false,
                batch_size: 256,
                fg_fraction: r64(0.5),
                positive_weight: r64(-1.0),
                allowed_border: r64(0.0),
                train: Default::default(),
                test: Default::default(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TrainProposalConfig {
        pub pre_nms_top_n: usize,
        pub post_nms_top_n: usize,
        pub nms_threshold: R64,
        pub min_size: R64,
    }

    impl Default for TrainProposalConfig {
        fn default() -> Self {
            Self {
                pre_nms_top_n: 12000,
                post_nms_top_n: 2000,
                nms_threshold: r64(0.7),
                min_size: r64(16.0),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TestProposalConfig {
        pub pre_nms_top_n: usize,
        pub post_nms_top_n: usize,
        pub nms_threshold: R64,
        pub min_size: R64,
        /// Number of proposals kept in the "top" mode.
        pub top_n: usize,
    }

    impl Default for TestProposalConfig {
        fn default() -> Self {
            Self {
                pre_nms_top_n: 6000,
                post_nms_top_n: 300,
                nms_threshold: r64(0.7),
                min_size: r64(16.0),
                top_n: 5000,
            }
        }
    }
}

mod rcnn {
    use super::*;

    /// Second stage classifier options.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RcnnConfig {
        pub batch_size: usize,
        pub fg_fraction: R64,
        pub fg_threshold: R64,
        pub bg_threshold_lo: R64,
        pub bg_threshold_hi: R64,
        pub sigma: R64,
        /// Append ground truth boxes to the proposals in training.
        pub use_gt: bool,
        pub bbox_normalize_means: [f64; 4],
        pub bbox_normalize_stds: [f64; 4],
        /// Normalize the regression targets in training and de-normalize the
        /// predictions at inference.
        pub bbox_normalize_targets_precomputed: bool,
        pub truncated_init: bool,
    }

    impl Default for RcnnConfig {
        fn default() -> Self {
            Self {
                batch_size: 128,
                fg_fraction: r64(0.25),
                fg_threshold: r64(0.5),
                bg_threshold_lo: r64(0.0),
                bg_threshold_hi: r64(0.5),
                sigma: r64(1.0),
                use_gt: false,
                bbox_normalize_means: [0.0; 4],
                bbox_normalize_stds: [0.1, 0.1, 0.2, 0.2],
                bbox_normalize_targets_precomputed: false,
                truncated_init: false,
            }
        }
    }
}

mod pooling {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PoolingConfig {
        pub mode: PoolingMode,
        /// Output side length of pooled features.
        pub size: i64,
        /// Crop at twice the size and then 2x2 max pool.
        pub crop_max_pool: bool,
    }

    impl Default for PoolingConfig {
        fn default() -> Self {
            Self {
                mode: PoolingMode::Crop,
                size: 7,
                crop_max_pool: true,
            }
        }
    }
}

mod block_mix {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BlockMixConfig {
        pub drop_prob: R64,
        pub block_size: i64,
        /// Interpolate the regions with their counterparts before pasting blocks.
        pub mixup: bool,
        /// Shape parameter of the Beta distribution of the mixup coefficient.
        pub mixup_alpha: R64,
    }

    impl Default for BlockMixConfig {
        fn default() -> Self {
            Self {
                drop_prob: r64(0.1),
                block_size: 3,
                mixup: false,
                mixup_alpha: r64(0.1),
            }
        }
    }
}

mod mode {
    use super::*;

    /// The loss composition used in training.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TrainingMode {
        Standard,
        /// Mixed images, RPN terms blended over two label sets.
        RpnMix,
        /// Like [TrainingMode::RpnMix] without the second stage.
        RpnMixOnly,
        /// Block-mix on pooled features, RCNN terms blended.
        RcnnMix,
    }

    impl Default for TrainingMode {
        fn default() -> Self {
            Self::Standard
        }
    }

    impl TrainingMode {
        /// Resolve the legacy boolean switches into a mode.
        pub fn from_flags(mix_training: bool, rpn_mix_only: bool, rcnn_mix: bool) -> Result<Self> {
            let mode = match (mix_training, rpn_mix_only, rcnn_mix) {
                (false, false, false) => Self::Standard,
                (true, false, false) => Self::RpnMix,
                (true, true, false) => Self::RpnMixOnly,
                (false, false, true) => Self::RcnnMix,
                (false, true, _) => bail!(DetectorError::config(
                    "rpn_mix_only requires mix_training to be enabled"
                )),
                (_, _, true) => bail!(DetectorError::config(
                    "rcnn_mix cannot be combined with mix_training or rpn_mix_only"
                )),
            };
            Ok(mode)
        }

        /// Whether the RPN losses are blended over two label sets.
        pub fn is_rpn_mix(&self) -> bool {
            matches!(self, Self::RpnMix | Self::RpnMixOnly)
        }

        /// Whether the second stage runs.
        pub fn has_rcnn(&self) -> bool {
            !matches!(self, Self::RpnMixOnly)
        }
    }

    impl fmt::Display for TrainingMode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let text = match self {
                Self::Standard => "standard",
                Self::RpnMix => "rpn_mix",
                Self::RpnMixOnly => "rpn_mix_only",
                Self::RcnnMix => "rcnn_mix",
            };
            write!(f, "{}", text)
        }
    }

    /// A mode name or the legacy flags.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum TrainingModeConfig {
        Mode(TrainingMode),
        Flags(TrainingFlags),
    }

    impl Default for TrainingModeConfig {
        fn default() -> Self {
            Self::Mode(TrainingMode::Standard)
        }
    }

    impl TrainingModeConfig {
        pub fn resolve(&self) -> Result<TrainingMode> {
            match *self {
                Self::Mode(mode) => Ok(mode),
                Self::Flags(TrainingFlags {
                    mix_training,
                    rpn_mix_only,
                    rcnn_mix,
                }) => TrainingMode::from_flags(mix_training, rpn_mix_only, rcnn_mix),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct TrainingFlags {
        pub mix_training: bool,
        pub rpn_mix_only: bool,
        pub rcnn_mix: bool,
    }

    /// Feature pooling variants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub enum PoolingMode {
        /// Bilinear crop and resize.
        Crop,
        /// Quantized region max pooling.
        Pool,
    }

    impl FromStr for PoolingMode {
        type Err = DetectorError;

        fn from_str(text: &str) -> Result<Self, Self::Err> {
            match text {
                "crop" => Ok(Self::Crop),
                "pool" => Ok(Self::Pool),
                _ => Err(DetectorError::UnsupportedMode(text.to_string())),
            }
        }
    }

    impl TryFrom<String> for PoolingMode {
        type Error = DetectorError;

        fn try_from(text: String) -> Result<Self, Self::Error> {
            text.parse()
        }
    }

    impl From<PoolingMode> for String {
        fn from(mode: PoolingMode) -> Self {
            match mode {
                PoolingMode::Crop => "crop",
                PoolingMode::Pool => "pool",
            }
            .to_string()
        }
    }

    /// Proposal selection variants at test time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub enum ProposalMode {
        /// Score sorting followed by non-maximum suppression.
        Nms,
        /// Top scoring boxes without suppression.
        Top,
    }

    impl Default for ProposalMode {
        fn default() -> Self {
            Self::Nms
        }
    }

    impl FromStr for ProposalMode {
        type Err = DetectorError;

        fn from_str(text: &str) -> Result<Self, Self::Err> {
            match text {
                "nms" => Ok(Self::Nms),
                "top" => Ok(Self::Top),
                _ => Err(DetectorError::UnsupportedMode(text.to_string())),
            }
        }
    }

    impl TryFrom<String> for ProposalMode {
        type Error = DetectorError;

        fn try_from(text: String) -> Result<Self, Self::Error> {
            text.parse()
        }
    }

    impl From<ProposalMode> for String {
        fn from(mode: ProposalMode) -> Self {
            match mode {
                ProposalMode::Nms => "nms",
                ProposalMode::Top => "top",
            }
            .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_is_valid() -> Result<()> {
        let config = Config::from_json5_str(include_str!("../config/detector.json5"))?;
        assert_eq!(config.anchors.num_anchors(), 9);
        assert_eq!(config.pooling.mode, PoolingMode::Crop);
        assert_eq!(config.proposal_mode, ProposalMode::Nms);
        assert_eq!(config.training_mode()?, TrainingMode::RcnnMix);
        assert!(config.block_mix.mixup);
        assert!(!config.rcnn.bbox_normalize_targets_precomputed);
        Ok(())
    }

    #[test]
    fn empty_config_uses_defaults() -> Result<()> {
        let config = Config::from_json5_str("{}")?;
        assert_eq!(config.rpn.batch_size, 256);
        assert_eq!(config.rpn.train.post_nms_top_n, 2000);
        assert_eq!(config.rpn.test.post_nms_top_n, 300);
        assert_eq!(config.rcnn.bbox_normalize_stds, [0.1, 0.1, 0.2, 0.2]);
        assert!(!config.rcnn.bbox_normalize_targets_precomputed);
        assert_eq!(config.training_mode()?, TrainingMode::Standard);
        Ok(())
    }

    #[test]
    fn legacy_flags_are_resolved() -> Result<()> {
        let config = Config::from_json5_str(
            "{ training_mode: { mix_training: true, rpn_mix_only: true } }",
        )?;
        assert_eq!(config.training_mode()?, TrainingMode::RpnMixOnly);

        assert_eq!(
            TrainingMode::from_flags(true, false, false)?,
            TrainingMode::RpnMix
        );
        assert_eq!(
            TrainingMode::from_flags(false, false, true)?,
            TrainingMode::RcnnMix
        );
        Ok(())
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        for (mix, rpn_only, rcnn) in [
            (true, false, true),
            (false, true, false),
            (true, true, true),
            (false, true, true),
        ] {
            let err = TrainingMode::from_flags(mix, rpn_only, rcnn).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DetectorError>(),
                Some(DetectorError::Configuration(_))
            ));
        }

        let result = Config::from_json5_str("{ training_mode: { mix_training: false, rcnn_mix: true, rpn_mix_only: true } }");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_modes_are_rejected() {
        assert_eq!(
            "roi_align".parse::<PoolingMode>(),
            Err(DetectorError::UnsupportedMode("roi_align".into()))
        );
        assert_eq!("pool".parse::<PoolingMode>(), Ok(PoolingMode::Pool));
        assert_eq!("top".parse::<ProposalMode>(), Ok(ProposalMode::Top));

        for text in [
            "{ pooling: { mode: 'align' } }",
            "{ proposal_mode: 'random' }",
        ] {
            let err = Config::from_json5_str(text).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DetectorError>(),
                Some(DetectorError::UnsupportedMode(_))
            ));
        }

        let config = Config::from_json5_str("{ pooling: { mode: 'pool' }, proposal_mode: 'top' }")
            .unwrap();
        assert_eq!(config.pooling.mode, PoolingMode::Pool);
        assert_eq!(config.proposal_mode, ProposalMode::Top);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_json5_str("{ rpn: { positive_weight: 1.5 } }").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectorError>(),
            Some(DetectorError::Configuration(_))
        ));
        assert!(Config::from_json5_str("{ block_mix: { block_size: 0 } }").is_err());
        assert!(Config::from_json5_str("{ block_mix: { mixup_alpha: 0 } }").is_err());
    }
}
