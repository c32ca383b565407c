//! Field catalog.
//!
//! Every column the compiler can select is a [`Field`]: an output name plus one
//! expression template per physical source. Templates may contain holes that
//! are filled at render time:
//!
//! * `{tz}` the filter's timezone name
//! * `{cast}` the custom metric cast function
//! * `{sample_factor}` / `{sample}` the sampling scale and `SAMPLE` clause
//! * `{time}` the tenant and time window predicate of the live tables
//! * `{imported_table}` / `{imported_time}` the imported table and its window
//!
//! A bare `?` binds the field's key argument (meta key, tag key or custom
//! metric key). The catalog is built once and shared read-only.

use std::fmt;
use std::sync::OnceLock;

use chrono_tz::Tz;
use pagetrail_core::{CustomMetricType, Direction};
use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::fragment::Fragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    SessionsAll,
    PageViewsAll,
    EventsAll,
    ClientId,
    VisitorId,
    SessionId,
    Count,
    Hostname,
    Path,
    EventPath,
    EntryPath,
    Entries,
    ExitPath,
    Exits,
    Visitors,
    VisitorsRaw,
    RelativeVisitors,
    Cr,
    CrPeriod,
    Sessions,
    Views,
    RelativeViews,
    Bounces,
    BounceRate,
    Referrer,
    AnyReferrer,
    ReferrerName,
    ReferrerIcon,
    Channel,
    Language,
    CountryCity,
    CountryRegion,
    Country,
    RegionCity,
    Region,
    City,
    Browser,
    BrowserVersion,
    Os,
    OsVersion,
    ScreenClass,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    UtmContent,
    UtmTerm,
    TagKeysRaw,
    TagValuesRaw,
    TagKey,
    TagValue,
    Title,
    EventTitle,
    EntryTitle,
    ExitTitle,
    SessionExitTitle,
    Time,
    MaxTime,
    Day,
    Hour,
    Minute,
    EventName,
    EventMeta,
    EventMetaKeys,
    EventMetaKeysRaw,
    EventMetaValues,
    EventMetaValuesRaw,
    EventTimeSpent,
    CustomMetricAvg,
    CustomMetricTotal,
    PlatformDesktop,
    PlatformMobile,
    PlatformUnknown,
    RelativePlatformDesktop,
    RelativePlatformMobile,
    RelativePlatformUnknown,
    EventDurationSeconds,
}

impl FieldId {
    /// Every field, in declaration order.
    pub const ALL: &'static [FieldId] = &[
        Self::SessionsAll,
        Self::PageViewsAll,
        Self::EventsAll,
        Self::ClientId,
        Self::VisitorId,
        Self::SessionId,
        Self::Count,
        Self::Hostname,
        Self::Path,
        Self::EventPath,
        Self::EntryPath,
        Self::Entries,
        Self::ExitPath,
        Self::Exits,
        Self::Visitors,
        Self::VisitorsRaw,
        Self::RelativeVisitors,
        Self::Cr,
        Self::CrPeriod,
        Self::Sessions,
        Self::Views,
        Self::RelativeViews,
        Self::Bounces,
        Self::BounceRate,
        Self::Referrer,
        Self::AnyReferrer,
        Self::ReferrerName,
        Self::ReferrerIcon,
        Self::Channel,
        Self::Language,
        Self::CountryCity,
        Self::CountryRegion,
        Self::Country,
        Self::RegionCity,
        Self::Region,
        Self::City,
        Self::Browser,
        Self::BrowserVersion,
        Self::Os,
        Self::OsVersion,
        Self::ScreenClass,
        Self::UtmSource,
        Self::UtmMedium,
        Self::UtmCampaign,
        Self::UtmContent,
        Self::UtmTerm,
        Self::TagKeysRaw,
        Self::TagValuesRaw,
        Self::TagKey,
        Self::TagValue,
        Self::Title,
        Self::EventTitle,
        Self::EntryTitle,
        Self::ExitTitle,
        Self::SessionExitTitle,
        Self::Time,
        Self::MaxTime,
        Self::Day,
        Self::Hour,
        Self::Minute,
        Self::EventName,
        Self::EventMeta,
        Self::EventMetaKeys,
        Self::EventMetaKeysRaw,
        Self::EventMetaValues,
        Self::EventMetaValuesRaw,
        Self::EventTimeSpent,
        Self::CustomMetricAvg,
        Self::CustomMetricTotal,
        Self::PlatformDesktop,
        Self::PlatformMobile,
        Self::PlatformUnknown,
        Self::RelativePlatformDesktop,
        Self::RelativePlatformMobile,
        Self::RelativePlatformUnknown,
        Self::EventDurationSeconds,
    ];

    pub fn is_platform(self) -> bool {
        matches!(
            self,
            Self::PlatformDesktop | Self::PlatformMobile | Self::PlatformUnknown
        )
    }
}

/// Where a field expression is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Sessions,
    PageViews,
    Events,
    /// Re-aggregation of already bucketed rows.
    Period,
    /// The outer select of a live/imported merge.
    Merged,
    /// Inside the imported side select.
    Imported,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sessions => "sessions",
            Self::PageViews => "page views",
            Self::Events => "events",
            Self::Period => "period",
            Self::Merged => "merged",
            Self::Imported => "imported",
        })
    }
}

/// How sampling scales a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    None,
    /// Scaled and clamped to a non-negative integer.
    Int,
    Float,
    /// Integer for integer custom metrics, float otherwise.
    Auto,
}

/// The filter value a bare `?` in the template binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundArg {
    None,
    MetaKey,
    TagKey,
    CustomMetricKey,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: FieldId,
    /// Output column name; empty for multi-column shapes.
    pub name: &'static str,
    pub sessions: &'static str,
    pub page_views: &'static str,
    pub events: Option<&'static str>,
    pub period: Option<&'static str>,
    pub merged: Option<&'static str>,
    pub imported: Option<&'static str>,
    /// Predicates selecting the platform this field counts.
    pub platform: Option<&'static [&'static str]>,
    pub direction: Option<Direction>,
    pub fixed_fill: Option<&'static str>,
    pub gap_fill: bool,
    pub timezone: bool,
    pub ratio: bool,
    /// Merged by adding the live and imported counts.
    pub additive: bool,
    pub sample: SampleKind,
    pub arg: BoundArg,
}

impl Field {
    fn template(&self, source: Source) -> Option<&'static str> {
        match source {
            Source::Sessions => Some(self.sessions),
            Source::PageViews => Some(self.page_views),
            Source::Events => Some(self.events.unwrap_or(self.page_views)),
            Source::Period => self.period,
            Source::Merged => self.merged,
            Source::Imported => Some(self.imported.or(self.period).unwrap_or(self.name)),
        }
    }

    pub fn sample_kind(&self, custom_metric: Option<CustomMetricType>) -> SampleKind {
        match self.sample {
            SampleKind::Auto if custom_metric == Some(CustomMetricType::Integer) => SampleKind::Int,
            SampleKind::Auto => SampleKind::Float,
            kind => kind,
        }
    }
}

/// Everything a template may refer to.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub source: Source,
    pub sample: u32,
    pub timezone: Tz,
    pub custom_metric: Option<CustomMetricType>,
    pub meta_key: Option<&'a str>,
    pub tag_key: Option<&'a str>,
    pub custom_metric_key: Option<&'a str>,
    pub time: Option<&'a Fragment>,
    pub imported_table: Option<&'a str>,
    pub imported_time: Option<&'a Fragment>,
}

impl<'a> RenderContext<'a> {
    pub fn new(source: Source, timezone: Tz) -> Self {
        Self {
            source,
            sample: 0,
            timezone,
            custom_metric: None,
            meta_key: None,
            tag_key: None,
            custom_metric_key: None,
            time: None,
            imported_table: None,
            imported_time: None,
        }
    }
}

pub struct Catalog {
    fields: Vec<Field>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            fields: FieldId::ALL.iter().map(|&id| describe(id)).collect(),
        }
    }

    /// The process-wide catalog.
    pub fn shared() -> &'static Catalog {
        static CATALOG: OnceLock<Catalog> = OnceLock::new();
        CATALOG.get_or_init(Catalog::new)
    }

    pub fn get(&self, id: FieldId) -> &Field {
        &self.fields[id as usize]
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Renders `id` for `ctx.source`.
    ///
    /// Returns `Ok(None)` when the field needs a key or metric type the
    /// context does not carry; such fields are left out of the select list.
    pub fn render(
        &self,
        id: FieldId,
        ctx: &RenderContext<'_>,
    ) -> Result<Option<Fragment>, CompileError> {
        let field = self.get(id);
        let missing = || CompileError::MissingExpression {
            field: id,
            target: ctx.source,
        };
        let template = field.template(ctx.source).ok_or_else(missing)?;
        let bound = match field.arg {
            BoundArg::None => None,
            BoundArg::MetaKey => ctx.meta_key,
            BoundArg::TagKey => ctx.tag_key,
            BoundArg::CustomMetricKey => ctx.custom_metric_key,
        };
        if field.arg != BoundArg::None && bound.is_none() {
            return Ok(None);
        }
        let cast = match ctx.custom_metric {
            Some(metric) => metric.cast_function(),
            None if template.contains("{cast}") => return Ok(None),
            None => "",
        };

        let mut out = Fragment::default();
        let mut rest = template;
        while let Some(pos) = rest.find(['{', '?']) {
            out.push_sql(&rest[..pos]);
            if rest[pos..].starts_with('?') {
                out.push_sql("?");
                out.bind(bound.ok_or_else(missing)?);
                rest = &rest[pos + 1..];
                continue;
            }
            let Some(len) = rest[pos..].find('}') else {
                break;
            };
            let hole = &rest[pos + 1..pos + len];
            match hole {
                "tz" => out.push_sql(ctx.timezone.name()),
                "cast" => out.push_sql(cast),
                "sample_factor" if ctx.sample > 0 => out.push_sql("*any(_sample_factor)"),
                "sample" if ctx.sample > 0 => out.push_sql(&format!(" SAMPLE {}", ctx.sample)),
                "sample_factor" | "sample" => {}
                "time" => out.append(ctx.time.ok_or_else(missing)?.clone()),
                "imported_table" => out.push_sql(ctx.imported_table.ok_or_else(missing)?),
                "imported_time" => out.append(ctx.imported_time.ok_or_else(missing)?.clone()),
                _ => out.push_sql(&rest[pos..=pos + len]),
            }
            rest = &rest[pos + len + 1..];
        }
        out.push_sql(rest);

        if ctx.sample > 0 && !matches!(ctx.source, Source::Merged | Source::Imported) {
            match field.sample_kind(ctx.custom_metric) {
                SampleKind::Int => {
                    out.sql = format!("toUInt64(greatest({}*any(_sample_factor), 0))", out.sql);
                }
                SampleKind::Float => out.push_sql("*any(_sample_factor)"),
                SampleKind::None | SampleKind::Auto => {}
            }
        }
        Ok(Some(out))
    }
}

// ----------------------------------------------------------------------------
// Field table
// ----------------------------------------------------------------------------

const SESSION_COLUMNS: &str = "t.visitor_id visitor_id,t.session_id session_id,max(t.time) session_time,min(t.start) session_start,max(t.duration_seconds) session_duration_seconds,any(t.entry_path) session_entry_path,t.exit_path session_exit_path,max(t.page_views) session_page_views,min(t.is_bounce) session_is_bounce,any(t.entry_title) session_entry_title,t.exit_title session_exit_title,any(t.hostname) session_hostname,any(t.language) session_language,any(t.country_code) session_country_code,any(t.region) session_region,any(t.city) session_city,any(t.referrer) session_referrer,any(t.referrer_name) session_referrer_name,any(t.referrer_icon) session_referrer_icon,any(t.channel) session_channel,any(t.os) session_os,any(t.os_version) session_os_version,any(t.browser) session_browser,any(t.browser_version) session_browser_version,any(t.desktop) session_desktop,any(t.mobile) session_mobile,any(t.screen_class) session_screen_class,any(t.utm_source) session_utm_source,any(t.utm_medium) session_utm_medium,any(t.utm_campaign) session_utm_campaign,any(t.utm_content) session_utm_content,any(t.utm_term) session_utm_term";

const PAGE_VIEW_COLUMNS: &str = "t.visitor_id,t.session_id,time,duration_seconds,hostname,path,title,language,country_code,region,city,referrer,referrer_name,referrer_icon,channel,os,os_version,browser,browser_version,desktop,mobile,screen_class,utm_source,utm_medium,utm_campaign,utm_content,utm_term,tag_keys,tag_values";

const EVENT_COLUMNS: &str = "t.visitor_id,time,t.session_id,event_name,event_meta_keys,event_meta_values,duration_seconds,hostname,path,title,language,country_code,region,city,referrer,referrer_name,referrer_icon,channel,os,os_version,browser,browser_version,desktop,mobile,screen_class,utm_source,utm_medium,utm_campaign,utm_content,utm_term";

const RELATIVE_VISITORS: &str = r#"toFloat64OrDefault(visitors / greatest((SELECT uniq(visitor_id){sample_factor} FROM "session"{sample} WHERE {time}), 1))"#;
const RELATIVE_VISITORS_MERGED: &str = r#"toFloat64OrDefault(visitors / greatest((SELECT uniq(visitor_id){sample_factor} FROM "session"{sample} WHERE {time}) + (SELECT sum(visitors) FROM "{imported_table}" WHERE {imported_time}), 1))"#;
const RELATIVE_VIEWS: &str = r#"toFloat64OrDefault(views / greatest((SELECT sum(page_views*sign){sample_factor} views FROM "session"{sample} WHERE {time}), 1))"#;
const RELATIVE_VIEWS_MERGED: &str = r#"toFloat64OrDefault(views / greatest((SELECT sum(page_views*sign){sample_factor} views FROM "session"{sample} WHERE {time}) + (SELECT sum(views) FROM "{imported_table}" WHERE {imported_time}), 1))"#;
const BOUNCE_RATE: &str = "bounces / IF(sessions = 0, 1, sessions)";
const RELATIVE_DESKTOP: &str = "platform_desktop / IF(platform_desktop + platform_mobile + platform_unknown = 0, 1, platform_desktop + platform_mobile + platform_unknown)";
const RELATIVE_MOBILE: &str = "platform_mobile / IF(platform_desktop + platform_mobile + platform_unknown = 0, 1, platform_desktop + platform_mobile + platform_unknown)";
const RELATIVE_UNKNOWN: &str = "platform_unknown / IF(platform_desktop + platform_mobile + platform_unknown = 0, 1, platform_desktop + platform_mobile + platform_unknown)";

const fn column(id: FieldId, name: &'static str, expr: &'static str) -> Field {
    Field {
        id,
        name,
        sessions: expr,
        page_views: expr,
        events: None,
        period: None,
        merged: None,
        imported: None,
        platform: None,
        direction: None,
        fixed_fill: None,
        gap_fill: false,
        timezone: false,
        ratio: false,
        additive: false,
        sample: SampleKind::None,
        arg: BoundArg::None,
    }
}

/// A plain column sorted ascending.
const fn dimension(id: FieldId, name: &'static str) -> Field {
    Field {
        direction: Some(Direction::Asc),
        ..column(id, name, name)
    }
}

/// An aggregate sorted descending.
const fn metric(id: FieldId, name: &'static str, expr: &'static str, sample: SampleKind) -> Field {
    Field {
        direction: Some(Direction::Desc),
        sample,
        ..column(id, name, expr)
    }
}

fn describe(id: FieldId) -> Field {
    use FieldId as F;
    use SampleKind::{Auto, Float, Int};

    let asc = Some(Direction::Asc);
    match id {
        F::SessionsAll => column(id, "", SESSION_COLUMNS),
        F::PageViewsAll => column(id, "", PAGE_VIEW_COLUMNS),
        F::EventsAll => column(id, "", EVENT_COLUMNS),
        F::ClientId => column(id, "client_id", "t.client_id"),
        F::VisitorId => column(id, "visitor_id", "t.visitor_id"),
        F::SessionId => column(id, "session_id", "t.session_id"),
        F::Count => metric(id, "count", "count(*)", Int),
        F::Hostname => dimension(id, "hostname"),
        F::Path => Field {
            merged: Some("coalesce(nullif(t.path, ''), imp.path)"),
            ..dimension(id, "path")
        },
        F::EventPath => Field {
            page_views: "t.path",
            ..dimension(id, "path")
        },
        F::EntryPath => Field {
            merged: Some("coalesce(nullif(t.entry_path, ''), imp.entry_path)"),
            ..dimension(id, "entry_path")
        },
        F::Entries => Field {
            page_views: "uniq(t.visitor_id, t.session_id)",
            ..metric(id, "entries", "sum(sign)", Int)
        },
        F::ExitPath => Field {
            merged: Some("coalesce(nullif(t.exit_path, ''), imp.exit_path)"),
            ..dimension(id, "exit_path")
        },
        F::Exits => Field {
            page_views: "uniq(t.visitor_id, t.session_id)",
            ..metric(id, "exits", "sum(sign)", Int)
        },
        F::Visitors => Field {
            period: Some("sum(visitors)"),
            merged: Some("sum(t.visitors + imp.visitors)"),
            additive: true,
            ..metric(id, "visitors", "uniq(t.visitor_id)", Int)
        },
        F::VisitorsRaw => metric(id, "visitors", "uniq(visitor_id)", Int),
        F::RelativeVisitors => Field {
            merged: Some(RELATIVE_VISITORS_MERGED),
            ratio: true,
            ..metric(id, "relative_visitors", RELATIVE_VISITORS, SampleKind::None)
        },
        F::Cr => Field {
            merged: Some(RELATIVE_VISITORS_MERGED),
            ratio: true,
            ..metric(id, "cr", RELATIVE_VISITORS, SampleKind::None)
        },
        F::CrPeriod => Field {
            merged: Some("max(t.cr)"),
            ..metric(
                id,
                "cr",
                "toFloat64OrDefault(visitors / greatest(ifNull(max(uvd.visitors), visitors), 1))",
                Float,
            )
        },
        F::Sessions => Field {
            period: Some("sum(sessions)"),
            merged: Some("sum(t.sessions + imp.sessions)"),
            additive: true,
            ..metric(id, "sessions", "uniq(t.visitor_id, t.session_id)", Int)
        },
        F::Views => Field {
            page_views: "count(1)",
            events: Some("sum(views)"),
            period: Some("sum(views)"),
            merged: Some("sum(t.views + imp.views)"),
            additive: true,
            ..metric(id, "views", "sum(page_views*sign)", Int)
        },
        F::RelativeViews => Field {
            merged: Some(RELATIVE_VIEWS_MERGED),
            ratio: true,
            ..metric(id, "relative_views", RELATIVE_VIEWS, SampleKind::None)
        },
        F::Bounces => Field {
            page_views: "uniqIf((t.visitor_id, t.session_id), bounces = 1)",
            period: Some("sum(bounces)"),
            merged: Some("sum(t.bounces + imp.bounces)"),
            additive: true,
            ..metric(id, "bounces", "sum(is_bounce*sign)", Int)
        },
        F::BounceRate => Field {
            period: Some("ifNotFinite(avg(bounce_rate), 0)"),
            merged: Some(BOUNCE_RATE),
            ..metric(id, "bounce_rate", BOUNCE_RATE, SampleKind::None)
        },
        F::Referrer => Field {
            merged: Some("coalesce(nullif(t.referrer, ''), imp.referrer)"),
            ..dimension(id, "referrer")
        },
        F::AnyReferrer => Field {
            direction: asc,
            ..column(id, "referrer", "any(referrer)")
        },
        F::ReferrerName => Field {
            merged: Some("coalesce(nullif(t.referrer_name, ''), imp.referrer_name)"),
            ..dimension(id, "referrer_name")
        },
        F::ReferrerIcon => Field {
            direction: asc,
            ..column(id, "referrer_icon", "any(referrer_icon)")
        },
        F::Channel => dimension(id, "channel"),
        F::Language => Field {
            merged: Some("coalesce(nullif(t.language, ''), imp.language)"),
            ..dimension(id, "language")
        },
        F::CountryCity => Field {
            merged: Some("coalesce(nullif(t.country_code, ''), imp.country_code)"),
            direction: asc,
            ..column(id, "country_code", "if(city = '', '', country_code)")
        },
        F::CountryRegion => Field {
            merged: Some("coalesce(nullif(t.country_code, ''), imp.country_code)"),
            direction: asc,
            ..column(id, "country_code", "if(region = '', '', country_code)")
        },
        F::Country => Field {
            merged: Some("coalesce(nullif(t.country_code, ''), imp.country_code)"),
            ..dimension(id, "country_code")
        },
        F::RegionCity => Field {
            merged: Some("coalesce(nullif(t.region, ''), imp.region)"),
            direction: asc,
            ..column(id, "region", "if(city = '', '', region)")
        },
        F::Region => Field {
            merged: Some("coalesce(nullif(t.region, ''), imp.region)"),
            ..dimension(id, "region")
        },
        F::City => Field {
            merged: Some("coalesce(nullif(t.city, ''), imp.city)"),
            ..dimension(id, "city")
        },
        F::Browser => Field {
            merged: Some("coalesce(nullif(t.browser, ''), imp.browser)"),
            ..dimension(id, "browser")
        },
        F::BrowserVersion => dimension(id, "browser_version"),
        F::Os => Field {
            merged: Some("coalesce(nullif(t.os, ''), imp.os)"),
            ..dimension(id, "os")
        },
        F::OsVersion => dimension(id, "os_version"),
        F::ScreenClass => dimension(id, "screen_class"),
        F::UtmSource => Field {
            merged: Some("coalesce(nullif(t.utm_source, ''), imp.utm_source)"),
            ..dimension(id, "utm_source")
        },
        F::UtmMedium => Field {
            merged: Some("coalesce(nullif(t.utm_medium, ''), imp.utm_medium)"),
            ..dimension(id, "utm_medium")
        },
        F::UtmCampaign => Field {
            merged: Some("coalesce(nullif(t.utm_campaign, ''), imp.utm_campaign)"),
            ..dimension(id, "utm_campaign")
        },
        F::UtmContent => dimension(id, "utm_content"),
        F::UtmTerm => dimension(id, "utm_term"),
        F::TagKeysRaw => column(id, "tag_keys", "tag_keys"),
        F::TagValuesRaw => column(id, "tag_values", "tag_values"),
        F::TagKey => column(id, "key", "arrayJoin(tag_keys)"),
        F::TagValue => Field {
            arg: BoundArg::TagKey,
            ..column(id, "value", "tag_values[indexOf(tag_keys, ?)]")
        },
        F::Title => dimension(id, "title"),
        F::EventTitle => Field {
            page_views: "t.title",
            events: Some("title"),
            ..dimension(id, "title")
        },
        F::EntryTitle => Field {
            direction: asc,
            ..column(id, "title", "entry_title")
        },
        F::ExitTitle => Field {
            direction: asc,
            ..column(id, "title", "exit_title")
        },
        F::SessionExitTitle => Field {
            direction: asc,
            ..column(id, "exit_title", "exit_title")
        },
        F::Time => Field {
            direction: asc,
            ..column(id, "time", "t.time")
        },
        F::MaxTime => Field {
            direction: asc,
            ..column(id, "max_time", "max(time)")
        },
        F::Day => Field {
            merged: Some("greatest(t.day, imp.day)"),
            imported: Some("date"),
            direction: asc,
            gap_fill: true,
            timezone: true,
            ..column(id, "day", "toDate(time, '{tz}')")
        },
        F::Hour => Field {
            direction: asc,
            fixed_fill: Some("WITH FILL FROM 0 TO 24"),
            timezone: true,
            ..column(id, "hour", "toHour(time, '{tz}')")
        },
        F::Minute => Field {
            direction: asc,
            fixed_fill: Some("WITH FILL FROM 0 TO 60"),
            timezone: true,
            ..column(id, "minute", "toMinute(time, '{tz}')")
        },
        F::EventName => dimension(id, "event_name"),
        F::EventMeta => column(
            id,
            "meta",
            "cast(arraySort(arrayZip(event_meta_keys, event_meta_values)), 'Map(String, String)')",
        ),
        F::EventMetaKeys => column(id, "meta_keys", "groupUniqArrayArray(event_meta_keys)"),
        F::EventMetaKeysRaw => column(id, "event_meta_keys", "event_meta_keys"),
        F::EventMetaValues => Field {
            arg: BoundArg::MetaKey,
            ..column(id, "meta_value", "event_meta_values[indexOf(event_meta_keys, ?)]")
        },
        F::EventMetaValuesRaw => column(id, "event_meta_values", "event_meta_values"),
        F::EventTimeSpent => Field {
            merged: Some("max(t.average_time_spent_seconds)"),
            sample: Int,
            ..column(
                id,
                "average_time_spent_seconds",
                "toUInt64(greatest(ifNotFinite(avg(duration_seconds), 0), 0))",
            )
        },
        F::CustomMetricAvg => Field {
            merged: Some("max(t.custom_metric_avg)"),
            sample: Float,
            arg: BoundArg::CustomMetricKey,
            ..column(
                id,
                "custom_metric_avg",
                "ifNotFinite(avg(coalesce({cast}(event_meta_values[indexOf(event_meta_keys, ?)]))), 0)",
            )
        },
        F::CustomMetricTotal => Field {
            merged: Some("sum(t.custom_metric_total)"),
            sample: Auto,
            arg: BoundArg::CustomMetricKey,
            ..column(
                id,
                "custom_metric_total",
                "sum(coalesce({cast}(event_meta_values[indexOf(event_meta_keys, ?)])))",
            )
        },
        F::PlatformDesktop => Field {
            merged: Some("sum(t.platform_desktop + imp.platform_desktop)"),
            imported: Some("sumIf(visitors, lower(category) IN ('desktop', 'laptop'))"),
            platform: Some(&["desktop = 1", "mobile = 0"]),
            sample: Int,
            ..column(id, "platform_desktop", "uniqIf(visitor_id, desktop = 1)")
        },
        F::PlatformMobile => Field {
            merged: Some("sum(t.platform_mobile + imp.platform_mobile)"),
            imported: Some("sumIf(visitors, lower(category) IN ('mobile', 'phone', 'tablet'))"),
            platform: Some(&["desktop = 0", "mobile = 1"]),
            sample: Int,
            ..column(id, "platform_mobile", "uniqIf(visitor_id, mobile = 1)")
        },
        F::PlatformUnknown => Field {
            merged: Some("sum(t.platform_unknown + imp.platform_unknown)"),
            imported: Some("sumIf(visitors, category = '')"),
            platform: Some(&["desktop = 0", "mobile = 0"]),
            sample: Int,
            ..column(
                id,
                "platform_unknown",
                "uniq(visitor_id)-platform_desktop-platform_mobile",
            )
        },
        F::RelativePlatformDesktop => Field {
            merged: Some(RELATIVE_DESKTOP),
            ..column(
                id,
                "relative_platform_desktop",
                RELATIVE_DESKTOP,
            )
        },
        F::RelativePlatformMobile => Field {
            merged: Some(RELATIVE_MOBILE),
            ..column(
                id,
                "relative_platform_mobile",
                RELATIVE_MOBILE,
            )
        },
        F::RelativePlatformUnknown => Field {
            merged: Some(RELATIVE_UNKNOWN),
            ..column(
                id,
                "relative_platform_unknown",
                RELATIVE_UNKNOWN,
            )
        },
        F::EventDurationSeconds => Field {
            sample: Int,
            ..column(id, "duration_seconds", "sum(duration_seconds)")
        },
    }
}

#[cfg(test)]
mod tests {
    use pagetrail_core::Arg;

    use super::*;

    fn ctx(source: Source) -> RenderContext<'static> {
        RenderContext::new(source, Tz::UTC)
    }

    #[test]
    fn field_order_matches_discriminants() {
        for (i, id) in FieldId::ALL.iter().enumerate() {
            assert_eq!(*id as usize, i, "{id:?}");
        }
        assert_eq!(Catalog::new().fields().count(), FieldId::ALL.len());
    }

    #[test]
    fn key_arguments_match_placeholders() {
        for field in Catalog::shared().fields() {
            for template in [field.sessions, field.page_views] {
                let holes = template.matches('?').count();
                let expected = usize::from(field.arg != BoundArg::None);
                assert_eq!(holes, expected, "{:?}", field.id);
            }
        }
    }

    #[test]
    fn timezone_flag_matches_templates() {
        for field in Catalog::shared().fields() {
            assert_eq!(field.sessions.contains("{tz}"), field.timezone, "{:?}", field.id);
            assert_eq!(field.sessions.contains("{time}"), field.ratio, "{:?}", field.id);
        }
    }

    #[test]
    fn renders_timezone_hole() {
        let tz: Tz = "Europe/Berlin".parse().expect("tz");
        let ctx = RenderContext::new(Source::Sessions, tz);
        let day = Catalog::shared()
            .render(FieldId::Day, &ctx)
            .expect("render")
            .expect("day");
        assert_eq!(day.sql, "toDate(time, 'Europe/Berlin')");
        assert!(day.args.is_empty());
    }

    #[test]
    fn events_fall_back_to_page_view_expressions() {
        let catalog = Catalog::shared();
        let views = catalog.render(FieldId::Views, &ctx(Source::Events)).expect("render");
        assert_eq!(views.map(|f| f.sql), Some("sum(views)".to_string()));
        let path = catalog.render(FieldId::EventPath, &ctx(Source::Events)).expect("render");
        assert_eq!(path.map(|f| f.sql), Some("t.path".to_string()));
    }

    #[test]
    fn keyed_fields_without_key_are_omitted() {
        let catalog = Catalog::shared();
        let value = catalog
            .render(FieldId::EventMetaValues, &ctx(Source::Events))
            .expect("render");
        assert_eq!(value, None);

        let mut with_key = ctx(Source::Events);
        with_key.meta_key = Some("plan");
        let value = catalog
            .render(FieldId::EventMetaValues, &with_key)
            .expect("render")
            .expect("value");
        assert_eq!(value.args, vec![Arg::from("plan")]);
    }

    #[test]
    fn custom_metric_needs_type_and_key() {
        let catalog = Catalog::shared();
        let mut c = ctx(Source::Events);
        c.custom_metric_key = Some("price");
        assert_eq!(catalog.render(FieldId::CustomMetricAvg, &c).expect("render"), None);

        c.custom_metric = Some(CustomMetricType::Float);
        let avg = catalog
            .render(FieldId::CustomMetricAvg, &c)
            .expect("render")
            .expect("avg");
        assert!(avg.sql.contains("toFloat64OrZero(event_meta_values"));
        assert_eq!(avg.args, vec![Arg::from("price")]);
    }

    #[test]
    fn sampling_scales_by_kind() {
        let catalog = Catalog::shared();
        let mut c = ctx(Source::Sessions);
        c.sample = 10_000_000;
        let visitors = catalog
            .render(FieldId::Visitors, &c)
            .expect("render")
            .expect("visitors");
        assert_eq!(
            visitors.sql,
            "toUInt64(greatest(uniq(t.visitor_id)*any(_sample_factor), 0))"
        );

        c.custom_metric = Some(CustomMetricType::Integer);
        c.custom_metric_key = Some("items");
        let total = catalog
            .render(FieldId::CustomMetricTotal, &c)
            .expect("render")
            .expect("total");
        assert!(total.sql.starts_with("toUInt64(greatest(sum(coalesce(toInt64OrZero("));

        c.custom_metric = Some(CustomMetricType::Float);
        let total = catalog
            .render(FieldId::CustomMetricTotal, &c)
            .expect("render")
            .expect("total");
        assert!(total.sql.ends_with(")))*any(_sample_factor)"));
    }

    #[test]
    fn ratio_embeds_time_window() {
        let time = Fragment::bound("client_id = ?", 1_i64);
        let mut c = ctx(Source::Sessions);
        c.time = Some(&time);
        c.sample = 100;
        let relative = Catalog::shared()
            .render(FieldId::RelativeVisitors, &c)
            .expect("render")
            .expect("relative");
        assert_eq!(
            relative.sql,
            r#"toFloat64OrDefault(visitors / greatest((SELECT uniq(visitor_id)*any(_sample_factor) FROM "session" SAMPLE 100 WHERE client_id = ?), 1))"#
        );
        assert_eq!(relative.args, vec![Arg::Int(1)]);
    }

    #[test]
    fn missing_merged_expression_is_an_error() {
        let err = Catalog::shared()
            .render(FieldId::Hostname, &ctx(Source::Merged))
            .expect_err("should fail");
        assert_eq!(
            err,
            CompileError::MissingExpression {
                field: FieldId::Hostname,
                target: Source::Merged,
            }
        );
    }

    #[test]
    fn imported_side_defaults_to_column_name() {
        let catalog = Catalog::shared();
        let country = catalog
            .render(FieldId::Country, &ctx(Source::Imported))
            .expect("render")
            .expect("country");
        assert_eq!(country.sql, "country_code");
        let visitors = catalog
            .render(FieldId::Visitors, &ctx(Source::Imported))
            .expect("render")
            .expect("visitors");
        assert_eq!(visitors.sql, "sum(visitors)");
    }
}
