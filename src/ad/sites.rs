//! Static site lookup tables.
//!
//! Executing hosts are mapped to a glidein resource name by domain suffix or
//! by the /16 prefix of their IP address, and resource names are then
//! canonicalized to a site name.

/// Domain suffix to resource name. Matched on the last three, then last two labels.
static RESERVED_DOMAINS: &[(&str, &str)] = &[
    ("aglt2.org", "AGLT2"),
    ("bridges.psc.edu", "Bridges"),
    ("campuscluster.illinois.edu", "Illinois"),
    ("cl.iit.edu", "MWT2"),
    ("cm.cluster", "LIDO_Dortmund"),
    ("cmsaf.mit.edu", "MIT"),
    ("colorado.edu", "Colorado"),
    ("cpp.ualberta.ca", "Alberta"),
    ("crc.nd.edu", "NWICG_NDCMS"),
    ("cci.wisc.edu", "CHTC"),
    ("chtc.wisc.edu", "CHTC"),
    ("cs.wisc.edu", "CS_WISC"),
    ("cse.buffalo.edu", "osgconnect"),
    ("discovery.wisc.edu", "CHTC"),
    ("ec2.internal", "AWS"),
    ("ember.arches", "Utah"),
    ("fnal.gov", "USCMS-FNAL-WC1"),
    ("grid.tu-dortmund.de", "LIDO_Dortmund"),
    ("guillimin.clumeq.ca", "Guillimin"),
    ("hcc.unl.edu", "Crane"),
    ("hep.caltech.edu", "CIT_CMS_T2"),
    ("hep.int", "osgconnect"),
    ("hep.olemiss.edu", "Miss"),
    ("hep.wisc.edu", "HEP_WISC"),
    ("icecube.wisc.edu", "NPX"),
    ("ics.psu.edu", "Bridges"),
    ("iihe.ac.be", "T2B_BE_IIHE"),
    ("illume.systems", "illume"),
    ("internal.cloudapp.net", "osgconnect"),
    ("isi.edu", "osgconnect"),
    ("iu.edu", "Indiana"),
    ("lidocluster.hp", "LIDO_Dortmund"),
    ("math.wisc.edu", "MATH_WISC"),
    ("mwt2.org", "MWT2"),
    ("msu.edu", "MSU"),
    ("nut.bu.edu", "Boston"),
    ("palmetto.clemson.edu", "Clemson-Palmetto"),
    ("panther.net", "FLTECH"),
    ("phys.uconn.edu", "UConn-OSG"),
    ("rcac.purdue.edu", "Purdue-Hadoop"),
    ("research.northwestern.edu", "NUMEP-OSG"),
    ("sdsc.edu", "Comet"),
    ("stat.wisc.edu", "CHTC"),
    ("t2.ucsd.edu", "UCSDT2"),
    ("tier3.ucdavis.edu", "UCD"),
    ("unl.edu", "Nebraska"),
    ("uppmax.uu.se", "Uppsala"),
    ("usatlas.bnl.gov", "BNL-ATLAS"),
    ("wisc.cloudlab.us", "CLOUD_WISC"),
    ("wisc.edu", "WISC"),
    ("zeuthen.desy.de", "DESY-ZN"),
];

/// IPv4 /16 prefix to resource name. Private ranges are handled in [`site_from_ip`].
static RESERVED_IPS: &[(&str, &str)] = &[
    ("18.12", "MIT"),
    ("23.22", "AWS"),
    ("35.9", "MSU"),
    ("40.78", "Azure"),
    ("40.112", "Azure"),
    ("50.16", "AWS"),
    ("50.17", "AWS"),
    ("54.144", "AWS"),
    ("54.145", "AWS"),
    ("54.157", "AWS"),
    ("54.158", "AWS"),
    ("54.159", "AWS"),
    ("54.161", "AWS"),
    ("54.163", "AWS"),
    ("54.166", "AWS"),
    ("54.167", "AWS"),
    ("54.197", "AWS"),
    ("54.204", "AWS"),
    ("54.205", "AWS"),
    ("54.211", "AWS"),
    ("54.227", "AWS"),
    ("54.243", "AWS"),
    ("72.36", "Illinois"),
    ("128.9", "osgconnect"),
    ("128.55", "Berkeley"),
    ("128.84", "NYSGRID_CORNELL_NYS1"),
    ("128.104", "CHTC"),
    ("128.105", "CHTC"),
    ("128.118", "Bridges"),
    ("128.120", "UCD"),
    ("128.205", "osgconnect"),
    ("128.211", "Purdue-Hadoop"),
    ("128.227", "FLTech"),
    ("128.230", "Syracuse"),
    ("129.74", "NWICG_NDCMS"),
    ("129.93", "Nebraska"),
    ("129.105", "NUMEP-OSG"),
    ("129.107", "UTA_SWT2"),
    ("129.119", "SU-OG"),
    ("129.128", "illume"),
    ("129.130", "Kansas"),
    ("129.217", "LIDO_Dortmund"),
    ("130.74", "Miss"),
    ("130.127", "Clemson-Palmetto"),
    ("130.199", "BNL-ATLAS"),
    ("131.94", "FLTECH"),
    ("131.215", "CIT_CMS_T2"),
    ("131.225", "USCMS-FNAL-WC1"),
    ("132.206", "CA-MCGILL-CLUMEQ-T2"),
    ("133.82", "Chiba"),
    ("134.93", "mainz"),
    ("136.145", "osgconnect"),
    ("137.99", "UConn-OSG"),
    ("137.135", "Azure"),
    ("138.23", "UCRiverside"),
    ("138.91", "Azure"),
    ("141.34", "DESY-HH"),
    ("142.150", "CA-SCINET-T2"),
    ("142.244", "Alberta"),
    ("144.92", "HEP_WISC"),
    ("149.165", "Indiana"),
    ("155.101", "Utah"),
    ("163.118", "FLTECH"),
    ("169.228", "UCSDT2"),
    ("171.67", "HOSTED_STANFORD"),
    ("174.129", "AWS"),
    ("184.73", "AWS"),
    ("192.5", "Boston"),
    ("192.12", "Colorado"),
    ("192.41", "AGLT2"),
    ("192.84", "Ultralight"),
    ("192.170", "MWT2"),
    ("193.58", "T2B_BE_IIHE"),
    ("193.190", "T2B_BE_IIHE"),
    ("198.32", "osgconnect"),
    ("198.48", "Hyak"),
    ("198.202", "Comet"),
    ("200.136", "SPRACE"),
    ("200.145", "SPRACE"),
    ("206.12", "CA-MCGILL-CLUMEQ-T2"),
    ("216.47", "MWT2"),
];

/// Resource name to canonical site name.
static SITE_NAMES: &[(&str, &str)] = &[
    ("DESY-ZN", "DE-DESY"),
    ("DESY-HH", "DE-DESY"),
    ("DESY", "DE-DESY"),
    ("Brussels", "BE-IIHE"),
    ("T2B_BE_IIHE", "BE-IIHE"),
    ("BEgrid-ULB-VUB", "BE-IIHE"),
    ("Guillimin", "CA-McGill"),
    ("CA-MCGILL-CLUMEQ-T2", "CA-McGill"),
    ("mainz", "DE-Mainz"),
    ("mainzgrid", "DE-Mainz"),
    ("CA-SCINET-T2", "CA-Toronto"),
    ("Alberta", "CA-Alberta"),
    ("parallel", "CA-Alberta"),
    ("jasper", "CA-Alberta"),
    ("illume", "CA-Alberta"),
    ("RWTH-Aachen", "DE-Aachen"),
    ("aachen", "DE-Aachen"),
    ("wuppertalprod", "DE-Wuppertal"),
    ("Uppsala", "SE-Uppsala"),
    ("Bartol", "US-Bartol"),
    ("UNI-DORTMUND", "DE-Dortmund"),
    ("LIDO_Dortmund", "DE-Dortmund"),
    ("PHIDO_Dortmund", "DE-Dortmund"),
    ("UKI-NORTHGRID-MAN-HEP", "UK-Manchester"),
    ("UKI-LT2-QMUL", "UK-Manchester"),
    ("Bridges", "XSEDE-Bridges"),
    ("Comet", "XSEDE-Comet"),
    ("HOSTED_STANFORD", "XSEDE-XStream"),
    ("Xstream", "XSEDE-XStream"),
    ("xstream", "XSEDE-XStream"),
    ("NPX", "US-NPX"),
    ("GZK", "US-GZK"),
    ("CHTC", "US-CHTC"),
    ("Marquette", "US-Marquette"),
    ("UMD", "US-UMD"),
    ("Japan", "JP-Chiba"),
    ("Chiba", "JP-Chiba"),
];

/// Resource names that carry no site information.
const BAD_RESOURCE_NAMES: &[&str] = &["other", "osgconnect", "xsede-osg", "WIPAC", "wipac"];

fn lookup(table: &'static [(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Whether a glidein resource name is a placeholder that needs a fallback lookup.
pub fn is_bad_resource_name(name: Option<&str>) -> bool {
    let Some(name) = name else {
        return true;
    };

    BAD_RESOURCE_NAMES.contains(&name)
        || name.contains('.')
        || name.starts_with("gzk9000")
        || name.starts_with("gzk-")
}

/// Resource name for a hostname, by its last three then last two domain labels.
pub fn site_from_domain(hostname: &str) -> Option<&'static str> {
    let lower = hostname.to_ascii_lowercase();
    let labels: Vec<&str> = lower.split('.').collect();

    [3, 2].into_iter().find_map(|n| {
        let start = labels.len().saturating_sub(n);
        lookup(RESERVED_DOMAINS, &labels[start..].join("."))
    })
}

/// Resource name for a dotted-quad IPv4 address, by its /16 prefix.
///
/// Private ranges (10/8, 172.16/12, 192.168/16) never resolve.
pub fn site_from_ip(ip: &str) -> Option<&'static str> {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4
        || !parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let first: u32 = parts[0].parse().ok()?;
    let second: u32 = parts[1].parse().ok()?;
    if first == 10 || (first == 172 && (16..32).contains(&second)) || (first == 192 && second == 168)
    {
        return None;
    }

    lookup(RESERVED_IPS, &format!("{}.{}", parts[0], parts[1]))
}

/// Canonical site name for a resource name, or `"other"`.
pub fn canonical_site(resource_name: &str) -> &'static str {
    lookup(SITE_NAMES, resource_name).unwrap_or("other")
}
